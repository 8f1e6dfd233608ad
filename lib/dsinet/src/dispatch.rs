//! Readiness multiplexer underneath the communication engine. File
//! descriptors are registered level-triggered with their fd value as the
//! token; the engine interprets the tokens. A registration/readiness pair
//! provides the cross-thread wakeup used by `stop`.

use mio::unix::EventedFd;
use mio::{Event, Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Token of the internal wakeup registration.
pub const WAKE_TOKEN: Token = Token(std::usize::MAX - 1);

#[derive(Debug, Default)]
struct StopState {
    stopped: AtomicBool,
    exitcode: AtomicI32,
}

/// Cross-thread handle that breaks the event loop. The only engine
/// operation that is safe to call from a foreign thread.
#[derive(Clone)]
pub struct StopHandle {
    ready: SetReadiness,
    state: Arc<StopState>,
}

impl StopHandle {
    pub fn stop(&self, exitcode: i32) {
        self.state.exitcode.store(exitcode, Ordering::SeqCst);
        self.state.stopped.store(true, Ordering::SeqCst);
        let _ = self.ready.set_readiness(Ready::readable());
    }
}

pub struct Dispatcher {
    poll: Poll,
    events: Events,
    _wake: Registration,
    ready: SetReadiness,
    state: Arc<StopState>,
}

impl Dispatcher {
    pub fn new() -> io::Result<Dispatcher> {
        let poll = Poll::new()?;
        let (wake, ready) = Registration::new2();

        poll.register(&wake, WAKE_TOKEN, Ready::readable(), PollOpt::level())?;

        Ok(Dispatcher {
            poll,
            events: Events::with_capacity(1024),
            _wake: wake,
            ready,
            state: Arc::new(StopState::default()),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            ready: self.ready.clone(),
            state: self.state.clone(),
        }
    }

    pub fn stop(&self, exitcode: i32) {
        self.stop_handle().stop(exitcode);
    }

    /// Exit code once `stop` has been requested.
    pub fn exit_code(&self) -> Option<i32> {
        if self.state.stopped.load(Ordering::SeqCst) {
            Some(self.state.exitcode.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Rearm for the next run after a previous loop was stopped.
    pub fn reset(&self) {
        self.state.stopped.store(false, Ordering::SeqCst);
        let _ = self.ready.set_readiness(Ready::empty());
    }

    pub fn register_fd(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.poll
            .register(&EventedFd(&fd), Token(fd as usize), interest, PollOpt::level())
    }

    pub fn deregister_fd(&self, fd: RawFd) -> io::Result<()> {
        self.poll.deregister(&EventedFd(&fd))
    }

    /// Block until at least one registered descriptor is ready or the loop
    /// is stopped, returning the raw events. The wakeup token is filtered
    /// out.
    pub fn wait(&mut self) -> io::Result<Vec<Event>> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(_) => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        let mut ready = Vec::with_capacity(self.events.iter().count());

        for event in &self.events {
            if event.token() == WAKE_TOKEN {
                let _ = self.ready.set_readiness(Ready::empty());
                continue;
            }

            ready.push(event);
        }

        Ok(ready)
    }
}
