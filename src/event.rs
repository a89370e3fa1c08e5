//! Single-threaded event loop: fd readiness, signals and timers.
//!
//! Components register interest under a typed [`Source`] token; each call to
//! [`EventLoop::wait`] blocks in `poll(2)` and returns the batch of typed
//! events, in the order the file descriptors were registered. All supervisor
//! work runs to completion between two `wait` calls.

use std::{
    os::fd::{BorrowedFd, RawFd},
    time::{Duration, Instant},
};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use tracing::warn;

use crate::{error::SupervisorError, sig};

/// Identifies a registered file-descriptor source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The signal self-pipe read end.
    Signal,
    /// The API listener socket.
    Api,
    /// An accepted API client connection.
    ApiConn(usize),
    /// The configuration inotify watcher.
    ConfWatch,
    /// A plugin-owned descriptor, keyed by plugin index.
    Plugin(usize),
}

/// Identifies a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Periodic instability-decay tick (`service-interval`).
    Tick,
    /// Deadline for escalating SIGTERM to SIGKILL.
    Kill,
}

/// One event delivered by [`EventLoop::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The source's descriptor is readable.
    Readable(Source),
    /// A signal arrived via the self-pipe.
    Signal(nix::sys::signal::Signal),
    /// A timer expired.
    Tick(Timer),
    /// The source's descriptor reported an error or hangup.
    Closed(Source),
}

#[derive(Debug)]
struct TimerEnt {
    timer: Timer,
    deadline: Instant,
    period: Option<Duration>,
}

/// The poll-based multiplexer driving the whole supervisor.
#[derive(Debug, Default)]
pub struct EventLoop {
    sources: Vec<(Source, RawFd)>,
    timers: Vec<TimerEnt>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `fd` under `source`. Re-registering a source replaces its fd.
    pub fn register(&mut self, source: Source, fd: RawFd) {
        self.unregister(source);
        self.sources.push((source, fd));
    }

    /// Drops the registration for `source`, if any. The fd is not closed.
    pub fn unregister(&mut self, source: Source) {
        self.sources.retain(|(existing, _)| *existing != source);
    }

    /// Arms `timer` to fire after `after`, then every `period` if given.
    /// Re-arming an existing timer replaces it.
    pub fn set_timer(&mut self, timer: Timer, after: Duration, period: Option<Duration>) {
        self.cancel_timer(timer);
        self.timers.push(TimerEnt {
            timer,
            deadline: Instant::now() + after,
            period,
        });
    }

    pub fn cancel_timer(&mut self, timer: Timer) {
        self.timers.retain(|ent| ent.timer != timer);
    }

    /// True when `timer` is currently armed.
    pub fn timer_armed(&self, timer: Timer) -> bool {
        self.timers.iter().any(|ent| ent.timer == timer)
    }

    /// Blocks until at least one event is due and returns the batch.
    pub fn wait(&mut self) -> Result<Vec<Event>, SupervisorError> {
        let timeout = self.next_timeout();

        let mut pollfds: Vec<PollFd> = self
            .sources
            .iter()
            .map(|(_, fd)| {
                // Fds are owned by their registering components and outlive
                // the poll call.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN)
            })
            .collect();

        // Clamp to u16 millis; a truncated wait just loops once more.
        let poll_timeout = match timeout {
            Some(timeout) => {
                PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16)
            }
            None => PollTimeout::NONE,
        };

        let mut events = Vec::new();
        match nix::poll::poll(&mut pollfds, poll_timeout) {
            Ok(_) => {
                let revents: Vec<Option<PollFlags>> =
                    pollfds.iter().map(|pfd| pfd.revents()).collect();
                for ((source, fd), revents) in self.sources.iter().zip(revents) {
                    let Some(revents) = revents else { continue };
                    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                        events.push(Event::Closed(*source));
                        continue;
                    }
                    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                        match source {
                            Source::Signal => {
                                for signal in sig::drain(*fd) {
                                    events.push(Event::Signal(signal));
                                }
                            }
                            _ => events.push(Event::Readable(*source)),
                        }
                    }
                }
            }
            Err(nix::errno::Errno::EINTR) => {}
            Err(errno) => {
                warn!("poll failed: {errno}");
                return Err(SupervisorError::Event(errno));
            }
        }

        self.collect_expired(&mut events);
        Ok(events)
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .iter()
            .map(|ent| ent.deadline.saturating_duration_since(now))
            .min()
    }

    fn collect_expired(&mut self, events: &mut Vec<Event>) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.timers.len() {
            if self.timers[index].deadline > now {
                index += 1;
                continue;
            }

            let timer = self.timers[index].timer;
            events.push(Event::Tick(timer));
            match self.timers[index].period {
                Some(period) => {
                    self.timers[index].deadline = now + period;
                    index += 1;
                }
                None => {
                    self.timers.remove(index);
                }
            }
        }
    }
}
