//! Readiness registration surface consumed by the engine
//!
//! The engine never owns an event loop. Sockets register interest in
//! read/write/exception readiness with an injected [`Reactor`], and the
//! reactor calls back into [`SocketEvents`] handlers when the descriptor is
//! ready. The trait also carries the two scheduling primitives the engine
//! needs: a next-turn deferral (used so that an immediately-completing
//! connect is never finished inside the call that requested it) and one-shot
//! timers (used for the secure-handshake deadline).

mod poll;

pub use poll::PollReactor;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Opaque handle to a native socket descriptor.
pub type Descriptor = std::os::fd::RawFd;

/// Callbacks delivered when a registered descriptor becomes ready.
///
/// There is no payload beyond "the descriptor is ready"; the handler decides
/// what to do from its own state.
pub trait SocketEvents {
    fn on_read_ready(&mut self);
    fn on_write_ready(&mut self);
    fn on_exception(&mut self);
}

/// A registered event handler. Single-threaded by design; the reactor and
/// every handler live on the same thread.
pub type Handler = Rc<RefCell<dyn SocketEvents>>;

/// Token identifying a scheduled one-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(pub u64);

/// The event-loop interface the engine registers with.
///
/// Implementations hold weak references to handlers; a handler that has been
/// dropped is silently deregistered on the next dispatch.
pub trait Reactor {
    fn add_read_handler(&self, fd: Descriptor, handler: &Handler);
    fn drop_read_handler(&self, fd: Descriptor);

    fn add_write_handler(&self, fd: Descriptor, handler: &Handler);
    fn drop_write_handler(&self, fd: Descriptor);

    fn add_exception_handler(&self, fd: Descriptor, handler: &Handler);
    fn drop_exception_handler(&self, fd: Descriptor);

    /// Run `task` on the next reactor turn, after the current dispatch has
    /// fully unwound.
    fn defer(&self, task: Box<dyn FnOnce()>);

    /// Arm a one-shot timer. The task runs once `delay` has elapsed, unless
    /// the token is cancelled first.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerToken;

    /// Cancel a timer armed with [`Reactor::schedule`]. Cancelling an
    /// already-fired or unknown token is a no-op.
    fn cancel(&self, token: TimerToken);
}
