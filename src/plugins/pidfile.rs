//! Pidfile event monitor feeding the condition engine.
//!
//! Watches the run directory for `*.pid` files. A pidfile appearing marks
//! the owning service started (replacing the tracked pid for forking
//! daemons) and asserts `service/<name>/ready`; deletion clears it. After
//! a reload the `SvcReconf` hook reasserts conditions for running services
//! whose declarations did not change.

use std::{fs, path::Path};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use tracing::{debug, warn};

use crate::{
    constants::PIDFILE_SUFFIX,
    plugin::{Hook, Plugin, PluginCtx},
    runtime,
    svc::SvcState,
};

/// Reads the pid recorded in a pidfile.
pub fn read_pidfile(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// Inotify-driven pidfile monitor.
#[derive(Default)]
pub struct PidfilePlugin {
    inotify: Option<Inotify>,
}

impl PidfilePlugin {
    fn init_watch(&mut self) {
        let dir = runtime::run_dir();
        if let Err(err) = fs::create_dir_all(&dir) {
            warn!("pidfile: cannot create {}: {err}", dir.display());
            return;
        }

        let inotify = match Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
        {
            Ok(inotify) => inotify,
            Err(err) => {
                warn!("pidfile: inotify init failed: {err}");
                return;
            }
        };

        let mask = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_ATTRIB
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_DELETE;
        if let Err(err) = inotify.add_watch(&dir, mask) {
            warn!("pidfile: cannot watch {}: {err}", dir.display());
            return;
        }

        debug!("pidfile monitor active on {}", dir.display());
        self.inotify = Some(inotify);
    }

    fn handle_events(&mut self, ctx: &mut PluginCtx) {
        let Some(inotify) = &self.inotify else { return };
        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => return,
            Err(err) => {
                warn!("pidfile: invalid inotify event: {err}");
                return;
            }
        };

        for event in events {
            let Some(name) = &event.name else { continue };
            let name = name.to_string_lossy();
            if !name.ends_with(PIDFILE_SUFFIX) {
                continue;
            }

            let Some(index) = ctx.registry.find_by_pidfile(&name) else {
                continue;
            };
            let svc = ctx.registry.get_mut(index).expect("index from lookup");
            let cond = svc.ready_cond();

            if event.mask.intersects(
                AddWatchFlags::IN_CREATE
                    | AddWatchFlags::IN_ATTRIB
                    | AddWatchFlags::IN_MODIFY
                    | AddWatchFlags::IN_MOVED_TO,
            ) {
                svc.started = true;
                // Forking daemons write the pid of the detached child; that
                // one is the process to track from here on.
                if let Some(pidfile) = &svc.spec.pidfile {
                    if let Some(pid) = read_pidfile(pidfile) {
                        if pid > 0 && pid != svc.pid {
                            debug!(
                                "{} changed pid {} -> {pid}",
                                svc.spec.name, svc.pid
                            );
                            svc.pid = pid;
                        }
                    }
                }
                ctx.conds.set(&cond);
            } else if event.mask.intersects(AddWatchFlags::IN_DELETE) {
                ctx.conds.clear(&cond);
            }
        }
    }

    /// Reasserts readiness for services that kept running across a reload
    /// and were not changed; their producers will not re-announce.
    fn reassert(&self, ctx: &mut PluginCtx) {
        let reassert: Vec<String> = ctx
            .registry
            .iter()
            .filter(|svc| svc.state == SvcState::Running && !svc.dirty)
            .map(|svc| svc.ready_cond())
            .collect();

        for cond in reassert {
            ctx.conds.set(&cond);
        }
    }
}

impl Plugin for PidfilePlugin {
    fn name(&self) -> &'static str {
        "pidfile"
    }

    fn depends(&self) -> &'static [&'static str] {
        &["banner"]
    }

    fn hook(&mut self, hook: Hook, ctx: &mut PluginCtx) {
        match hook {
            Hook::BasefsUp => self.init_watch(),
            Hook::SvcReconf => self.reassert(ctx),
            _ => {}
        }
    }

    fn io_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::{AsFd, AsRawFd};
        self.inotify.as_ref().map(|ino| ino.as_fd().as_raw_fd())
    }

    fn io_ready(&mut self, ctx: &mut PluginCtx) {
        self.handle_events(ctx);
    }
}
