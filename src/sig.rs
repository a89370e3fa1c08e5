//! Signal controller: self-pipe handler and signal dispositions.
//!
//! The installed handler does nothing but write the signal number to a pipe;
//! the event loop drains the pipe and turns the bytes into typed events, so
//! no business logic ever runs in signal context.

use std::{
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicI32, Ordering},
};

use nix::{
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
    unistd::pipe,
};

use crate::error::SupervisorError;

/// Write end of the self-pipe, shared with the signal handler.
static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Global transition requested by a signal or client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigEvent {
    /// Reload configuration (SIGHUP).
    Reload,
    /// Halt the system, runlevel 0 (SIGUSR1).
    Halt,
    /// Power the system off, runlevel 0 (SIGUSR2).
    Poweroff,
    /// Reboot, runlevel 6 (SIGINT; Ctrl-Alt-Del arrives here on PID 1).
    Reboot,
    /// A child exited; reap all and step the affected services.
    Reap,
    /// Controlled shutdown of the current runlevel (SIGTERM).
    Shutdown,
}

/// Signals the supervisor subscribes to.
const SIGNALS: [Signal; 6] = [
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGINT,
    Signal::SIGCHLD,
    Signal::SIGTERM,
];

extern "C" fn handler(signo: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // Best effort; a full pipe just coalesces with pending signals.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Holds both ends of the self-pipe; the read end feeds the event loop.
#[derive(Debug)]
pub struct SignalPipe {
    rd: OwnedFd,
    _wr: OwnedFd,
}

impl SignalPipe {
    /// Descriptor to register with the event loop.
    pub fn fd(&self) -> RawFd {
        self.rd.as_raw_fd()
    }
}

/// Creates the self-pipe and installs handlers for all supervised signals.
pub fn install() -> Result<SignalPipe, SupervisorError> {
    let (rd, wr) = pipe()?;
    for fd in [&rd, &wr] {
        set_nonblocking(fd.as_raw_fd())?;
    }
    PIPE_WR.store(wr.as_raw_fd(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in SIGNALS {
        // Safety: the handler is async-signal-safe (one write(2) only).
        unsafe {
            sigaction(signal, &action)?;
        }
    }

    Ok(SignalPipe { rd, _wr: wr })
}

/// Marks `fd` nonblocking.
fn set_nonblocking(fd: RawFd) -> Result<(), SupervisorError> {
    // Safety: plain fcntl on an fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Drains pending signal bytes from the self-pipe read end.
pub fn drain(fd: RawFd) -> Vec<Signal> {
    let mut signals = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        // Safety: fd comes from our own pipe registration.
        let n = unsafe {
            libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n <= 0 {
            break;
        }
        for &byte in &buf[..n as usize] {
            if let Ok(signal) = Signal::try_from(byte as i32) {
                signals.push(signal);
            }
        }
    }
    signals
}

/// Maps a delivered signal to the supervisor action it requests.
pub fn event_for(signal: Signal) -> Option<SigEvent> {
    match signal {
        Signal::SIGHUP => Some(SigEvent::Reload),
        Signal::SIGUSR1 => Some(SigEvent::Halt),
        Signal::SIGUSR2 => Some(SigEvent::Poweroff),
        Signal::SIGINT => Some(SigEvent::Reboot),
        Signal::SIGCHLD => Some(SigEvent::Reap),
        Signal::SIGTERM => Some(SigEvent::Shutdown),
        _ => None,
    }
}
