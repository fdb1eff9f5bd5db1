//! Single-threaded I/O multiplexer
//!
//! The reactor owns a registry of descriptors, each paired with an
//! [`EventHandler`], and a set of one-shot timers. [`Reactor::run_once`] polls
//! every registered descriptor once, dispatches readiness to the handlers and
//! then fires expired timers. Handlers receive the reactor by `&mut` so they
//! can register, re-arm or drop sources while being dispatched.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::sys::{self, POLLFAIL, POLLIN, POLLOUT};
use crate::protocol::error::Result;

/// Identifies a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// Identifies a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Readiness a source waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }

    fn events(&self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= POLLIN;
        }
        if self.writable {
            events |= POLLOUT;
        }
        events
    }
}

/// Readiness reported for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup; the next I/O attempt reports the cause.
    pub failed: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        Readiness {
            readable: revents & POLLIN != 0,
            writable: revents & POLLOUT != 0,
            failed: revents & POLLFAIL != 0,
        }
    }
}

/// Receives readiness notifications for a registered source.
pub trait EventHandler {
    fn on_ready(&mut self, reactor: &mut Reactor, token: Token, readiness: Readiness);
}

/// Shared handle to a handler. A handler is dispatched through a mutable
/// borrow, so it must not be borrowed elsewhere while the reactor runs.
pub type Handler = Rc<RefCell<dyn EventHandler>>;

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce(&mut Reactor)>;

struct Source {
    fd: RawFd,
    interest: Interest,
    handler: Handler,
}

/// Self-pipe used to interrupt a blocked poll from another thread.
struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Waker { reader, writer })
    }

    fn wake(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = (&self.writer).write(&[1]);
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.reader).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ExitHandle {
    exit: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ExitHandle {
    pub fn exit(&self) {
        self.exit.store(true, Ordering::Release);
        self.waker.wake();
    }
}

impl fmt::Debug for ExitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitHandle")
            .field("exit", &self.exit.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct Reactor {
    sources: HashMap<Token, Source>,
    next_token: usize,
    timers: BTreeMap<(Instant, TimerId), TimerCallback>,
    timer_deadlines: HashMap<TimerId, Instant>,
    next_timer: u64,
    waker: Arc<Waker>,
    exit: Arc<AtomicBool>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("sources", &self.sources.len())
            .field("timers", &self.timers.len())
            .finish()
    }
}

impl Reactor {
    pub fn new() -> Result<Self> {
        Ok(Reactor {
            sources: HashMap::new(),
            next_token: 0,
            timers: BTreeMap::new(),
            timer_deadlines: HashMap::new(),
            next_timer: 0,
            waker: Arc::new(Waker::new()?),
            exit: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers `fd` for `interest`, dispatching readiness to `handler`.
    pub fn register(&mut self, fd: RawFd, interest: Interest, handler: Handler) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        trace!("register fd {} as {:?} for {:?}", fd, token, interest);
        self.sources.insert(
            token,
            Source {
                fd,
                interest,
                handler,
            },
        );
        token
    }

    /// Changes the interest of a registered source. Unknown tokens are ignored.
    pub fn reregister(&mut self, token: Token, interest: Interest) {
        if let Some(source) = self.sources.get_mut(&token) {
            source.interest = interest;
        }
    }

    /// Removes a source, dropping the reactor's handle to its handler.
    pub fn deregister(&mut self, token: Token) {
        if let Some(source) = self.sources.remove(&token) {
            trace!("deregister fd {} ({:?})", source.fd, token);
        }
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.sources.contains_key(&token)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Schedules `callback` to run once `deadline` has passed.
    pub fn add_timer(&mut self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.timers.insert((deadline, id), callback);
        self.timer_deadlines.insert(id, deadline);
        id
    }

    /// Cancels a pending timer. Returns false if it already fired.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        match self.timer_deadlines.remove(&id) {
            Some(deadline) => self.timers.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle {
            exit: self.exit.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Makes [`run`](Self::run) return after the current iteration.
    pub fn exit(&mut self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Polls once, waiting at most `timeout` (forever if `None`), then
    /// dispatches readiness and expired timers. Returns false if nothing
    /// happened.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        let wait = match self.timers.keys().next() {
            Some((deadline, _)) => {
                let until = deadline.saturating_duration_since(now);
                Some(timeout.map_or(until, |t| t.min(until)))
            }
            None => timeout,
        };

        let mut tokens = Vec::with_capacity(self.sources.len());
        let mut fds = Vec::with_capacity(self.sources.len() + 1);
        fds.push(libc::pollfd {
            fd: self.waker.reader.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        });
        for (token, source) in &self.sources {
            if source.interest.is_none() {
                continue;
            }
            tokens.push(*token);
            fds.push(libc::pollfd {
                fd: source.fd,
                events: source.interest.events(),
                revents: 0,
            });
        }

        let ready = sys::poll_fds(&mut fds, wait)?;
        let mut dispatched = false;

        if ready > 0 {
            if fds[0].revents != 0 {
                self.waker.drain();
                dispatched = true;
            }
            for (pollfd, token) in fds[1..].iter().zip(tokens) {
                if pollfd.revents == 0 {
                    continue;
                }
                // An earlier handler in this round may have dropped the source.
                let Some(handler) = self.sources.get(&token).map(|s| s.handler.clone()) else {
                    continue;
                };
                let readiness = Readiness::from_revents(pollfd.revents);
                trace!("{:?} ready: {:?}", token, readiness);
                handler.borrow_mut().on_ready(self, token, readiness);
                dispatched = true;
            }
        }

        dispatched |= self.fire_timers();
        Ok(dispatched)
    }

    fn fire_timers(&mut self) -> bool {
        let now = Instant::now();
        let mut fired = false;
        loop {
            let Some(&(deadline, id)) = self.timers.keys().next() else {
                break;
            };
            if deadline > now {
                break;
            }
            let Some(callback) = self.timers.remove(&(deadline, id)) else {
                break;
            };
            self.timer_deadlines.remove(&id);
            callback(self);
            fired = true;
        }
        fired
    }

    /// Runs until [`exit`](Self::exit) or an [`ExitHandle`] stops the loop.
    pub fn run(&mut self) -> Result<()> {
        debug!("reactor running with {} sources", self.sources.len());
        while !self.exit.swap(false, Ordering::AcqRel) {
            self.run_once(None)?;
        }
        debug!("reactor stopped");
        Ok(())
    }
}
