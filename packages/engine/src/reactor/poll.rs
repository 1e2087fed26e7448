//! Minimal poll(2)-backed reactor
//!
//! A readiness registry good enough for tests and small single-connection
//! applications. Larger applications are expected to bring their own event
//! loop and implement [`Reactor`] over it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Weak;
use std::time::{Duration, Instant};

use super::{Descriptor, Handler, Reactor, SocketEvents, TimerToken};

type WeakHandler = Weak<RefCell<dyn SocketEvents>>;

struct Timer {
    token: TimerToken,
    due: Instant,
    task: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct Inner {
    read: HashMap<Descriptor, WeakHandler>,
    write: HashMap<Descriptor, WeakHandler>,
    exception: HashMap<Descriptor, WeakHandler>,
    deferred: Vec<Box<dyn FnOnce()>>,
    timers: Vec<Timer>,
    next_timer: u64,
}

/// Single-threaded reactor over `poll(2)`.
#[derive(Default)]
pub struct PollReactor {
    inner: RefCell<Inner>,
}

impl PollReactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a write handler is currently registered for `fd`. Handy for
    /// asserting flow-control registration behaviour in tests.
    #[must_use]
    pub fn wants_write(&self, fd: Descriptor) -> bool {
        self.inner.borrow().write.contains_key(&fd)
    }

    /// Number of armed one-shot timers. Handy for asserting cancellation
    /// behaviour in tests.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    /// Dispatch a read-readiness notification to the registered handler.
    pub fn notify_read(&self, fd: Descriptor) {
        self.dispatch(fd, Kind::Read);
    }

    /// Dispatch a write-readiness notification to the registered handler.
    pub fn notify_write(&self, fd: Descriptor) {
        self.dispatch(fd, Kind::Write);
    }

    /// Dispatch an exception notification to the registered handler.
    pub fn notify_exception(&self, fd: Descriptor) {
        self.dispatch(fd, Kind::Exception);
    }

    /// Run every task queued with [`Reactor::defer`]. Returns how many ran.
    pub fn run_deferred(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut self.inner.borrow_mut().deferred);
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                ran += 1;
                task();
            }
        }
    }

    /// Run every timer whose deadline has passed. Returns how many fired.
    pub fn run_due_timers(&self) -> usize {
        let now = Instant::now();
        let mut fired = 0;
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                match inner.timers.iter().position(|t| t.due <= now) {
                    Some(idx) => inner.timers.swap_remove(idx),
                    None => return fired,
                }
            };
            fired += 1;
            (due.task)();
        }
    }

    /// One reactor turn: poll registered descriptors for up to `timeout`,
    /// dispatch whatever became ready, then run deferred tasks and due
    /// timers. Returns the number of descriptor events dispatched.
    pub fn turn(&self, timeout: Duration) -> usize {
        // Deferred work scheduled before this turn runs first and shortens
        // the poll to a non-blocking check.
        let had_deferred = !self.inner.borrow().deferred.is_empty();
        let next_due = self
            .inner
            .borrow()
            .timers
            .iter()
            .map(|t| t.due)
            .min();

        let mut wait = timeout;
        if had_deferred {
            wait = Duration::ZERO;
        } else if let Some(due) = next_due {
            let until = due.saturating_duration_since(Instant::now());
            if until < wait {
                wait = until;
            }
        }

        let ready = self.poll_descriptors(wait);
        for (fd, kind) in &ready {
            self.dispatch(*fd, *kind);
        }
        self.run_deferred();
        self.run_due_timers();
        ready.len()
    }

    fn poll_descriptors(&self, timeout: Duration) -> Vec<(Descriptor, Kind)> {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        {
            let inner = self.inner.borrow();
            let mut interests: HashMap<Descriptor, libc::c_short> = HashMap::new();
            for fd in inner.read.keys() {
                *interests.entry(*fd).or_insert(0) |= libc::POLLIN;
            }
            for fd in inner.write.keys() {
                *interests.entry(*fd).or_insert(0) |= libc::POLLOUT;
            }
            for fd in inner.exception.keys() {
                interests.entry(*fd).or_insert(0);
            }
            for (fd, events) in interests {
                fds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }
        if fds.is_empty() {
            if !timeout.is_zero() {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
            }
            return Vec::new();
        }

        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: fds points at a live, correctly-sized pollfd array.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rc <= 0 {
            return Vec::new();
        }

        let mut ready = Vec::new();
        for pfd in &fds {
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                ready.push((pfd.fd, Kind::Exception));
            }
            if pfd.revents & libc::POLLIN != 0 {
                ready.push((pfd.fd, Kind::Read));
            }
            if pfd.revents & libc::POLLOUT != 0 {
                ready.push((pfd.fd, Kind::Write));
            }
        }
        ready
    }

    fn dispatch(&self, fd: Descriptor, kind: Kind) {
        let handler = {
            let inner = self.inner.borrow();
            let map = match kind {
                Kind::Read => &inner.read,
                Kind::Write => &inner.write,
                Kind::Exception => &inner.exception,
            };
            map.get(&fd).cloned()
        };
        let Some(weak) = handler else { return };
        match weak.upgrade() {
            Some(handler) => {
                let mut handler = handler.borrow_mut();
                match kind {
                    Kind::Read => handler.on_read_ready(),
                    Kind::Write => handler.on_write_ready(),
                    Kind::Exception => handler.on_exception(),
                }
            }
            None => {
                // Handler is gone; drop the stale registration.
                let mut inner = self.inner.borrow_mut();
                let map = match kind {
                    Kind::Read => &mut inner.read,
                    Kind::Write => &mut inner.write,
                    Kind::Exception => &mut inner.exception,
                };
                map.remove(&fd);
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
    Exception,
}

impl Reactor for PollReactor {
    fn add_read_handler(&self, fd: Descriptor, handler: &Handler) {
        self.inner
            .borrow_mut()
            .read
            .insert(fd, std::rc::Rc::downgrade(handler));
    }

    fn drop_read_handler(&self, fd: Descriptor) {
        self.inner.borrow_mut().read.remove(&fd);
    }

    fn add_write_handler(&self, fd: Descriptor, handler: &Handler) {
        self.inner
            .borrow_mut()
            .write
            .insert(fd, std::rc::Rc::downgrade(handler));
    }

    fn drop_write_handler(&self, fd: Descriptor) {
        self.inner.borrow_mut().write.remove(&fd);
    }

    fn add_exception_handler(&self, fd: Descriptor, handler: &Handler) {
        self.inner
            .borrow_mut()
            .exception
            .insert(fd, std::rc::Rc::downgrade(handler));
    }

    fn drop_exception_handler(&self, fd: Descriptor) {
        self.inner.borrow_mut().exception.remove(&fd);
    }

    fn defer(&self, task: Box<dyn FnOnce()>) {
        self.inner.borrow_mut().deferred.push(task);
    }

    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerToken {
        let mut inner = self.inner.borrow_mut();
        inner.next_timer += 1;
        let token = TimerToken(inner.next_timer);
        inner.timers.push(Timer {
            token,
            due: Instant::now() + delay,
            task,
        });
        token
    }

    fn cancel(&self, token: TimerToken) {
        let mut inner = self.inner.borrow_mut();
        if let Some(idx) = inner.timers.iter().position(|t| t.token == token) {
            inner.timers.swap_remove(idx);
        }
    }
}
