//! Scheduler: the service state machine, the reaper and runlevel changes.
//!
//! [`Sched::step`] is the only entry point to the state machine; it advances
//! one service a single transition toward its target. Every external trigger
//! (child exit, condition change, reload, client command, runlevel change)
//! marks services dirty and calls [`Sched::step_all`], which iterates the
//! registry to a fixed point.

use std::time::{Duration, Instant};

use chrono::Utc;
use nix::sys::{
    signal::Signal,
    wait::{WaitPidFlag, WaitStatus, waitpid},
};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::{
    cgroup::CgroupTable,
    cond::{CondState, CondStore},
    conf::Conf,
    constants::{INSTABILITY_THRESHOLD, INSTABILITY_WINDOW},
    spawn,
    svc::{Registry, Svc, SvcKind, SvcState},
};

/// Kind filter for [`Sched::step_all`]; one bit per [`SvcKind`].
pub const KIND_ALL: u8 = 0x3F;

fn kind_bit(kind: SvcKind) -> u8 {
    1 << kind as u8
}

/// Builds a kind mask from a list of kinds.
pub fn kind_mask(kinds: &[SvcKind]) -> u8 {
    kinds.iter().fold(0, |mask, kind| mask | kind_bit(*kind))
}

/// How a service's condition expression currently evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// All atoms ON.
    Ok,
    /// At least one atom OFF.
    Off,
    /// No atom OFF, at least one FLUX.
    Flux {
        /// The service may be signalled instead of restarted.
        hup_ok: bool,
    },
}

fn verdict(svc: &Svc, conds: &CondStore) -> Verdict {
    let mut flux = false;
    let mut hup_ok = svc.spec.sighup;

    for atom in &svc.spec.cond {
        match conds.get(&atom.key) {
            CondState::Off => return Verdict::Off,
            CondState::Flux => {
                flux = true;
                if atom.pinned {
                    hup_ok = false;
                }
            }
            CondState::On => {}
        }
    }

    if flux { Verdict::Flux { hup_ok } } else { Verdict::Ok }
}

#[derive(Debug)]
struct KillEnt {
    pid: i32,
    deadline: Instant,
}

/// Drives services through their lifecycle and reaps their children.
#[derive(Debug)]
pub struct Sched {
    /// Current runlevel.
    pub runlevel: u8,
    /// Latched previous runlevel.
    pub prevlevel: u8,
    instability_threshold: u32,
    instability_window: Duration,
    kill_pending: Vec<KillEnt>,
}

impl Default for Sched {
    fn default() -> Self {
        Self::new()
    }
}

impl Sched {
    pub fn new() -> Self {
        Sched {
            runlevel: 0,
            prevlevel: 0,
            instability_threshold: INSTABILITY_THRESHOLD,
            instability_window: INSTABILITY_WINDOW,
            kill_pending: Vec::new(),
        }
    }

    /// Steps every registered service matching `mask` until a full pass makes
    /// no change. Returns the total number of transitions taken.
    pub fn step_all(
        &mut self,
        registry: &mut Registry,
        conds: &mut CondStore,
        conf: &Conf,
        cgroups: &CgroupTable,
        mask: u8,
    ) -> usize {
        let mut transitions = 0;
        // A pass over N services can unlock at most N more; anything beyond
        // that is a livelock in the state machine itself.
        let max_passes = registry.len().saturating_mul(2) + 2;

        for _ in 0..max_passes {
            let mut changed = false;
            for index in 0..registry.len() {
                let kind = match registry.get(index) {
                    Some(svc) => svc.spec.kind,
                    None => continue,
                };
                if kind_bit(kind) & mask == 0 {
                    continue;
                }
                if self.step(registry, index, conds, conf, cgroups) {
                    changed = true;
                    transitions += 1;
                }
            }
            if !changed {
                return transitions;
            }
        }

        warn!("step_all did not converge, giving up this round");
        transitions
    }

    /// Takes `registry[index]` one transition closer to its target state.
    /// Idempotent: returns false when the service is already settled.
    pub fn step(
        &mut self,
        registry: &mut Registry,
        index: usize,
        conds: &mut CondStore,
        conf: &Conf,
        cgroups: &CgroupTable,
    ) -> bool {
        let runlevel = self.runlevel;
        let Some(svc) = registry.get_mut(index) else {
            return false;
        };
        let eligible = svc.eligible(runlevel);
        let verdict = verdict(svc, conds);

        match svc.state {
            SvcState::Halted => {
                if eligible {
                    self.transition(svc, SvcState::Waiting);
                    return true;
                }
            }
            SvcState::Waiting => {
                if !eligible {
                    self.transition(svc, SvcState::Halted);
                    return true;
                }
                if verdict == Verdict::Ok {
                    self.transition(svc, SvcState::Ready);
                    return true;
                }
            }
            SvcState::Ready => {
                // Dirty before fork cancels the pending start; the service
                // re-evaluates from WAITING.
                if !eligible || verdict != Verdict::Ok || svc.dirty {
                    svc.dirty = false;
                    self.transition(svc, SvcState::Waiting);
                    return true;
                }
                match spawn::spawn_svc(svc, conf, cgroups) {
                    Ok(pid) => {
                        svc.pid = pid;
                        svc.started = false;
                        svc.started_at = Some(Utc::now());
                        self.transition(svc, SvcState::Starting);
                    }
                    Err(err) => {
                        warn!("Failed starting {}: {err}", svc.spec.name);
                        self.crash(svc);
                    }
                }
                return true;
            }
            SvcState::Starting => {
                if !eligible || verdict == Verdict::Off || svc.dirty {
                    self.stop_child(svc, conds, conf.stop_grace);
                    return true;
                }
                if svc.spec.kind.is_daemon() {
                    let ready = svc.spec.pidfile.is_none() || svc.started;
                    if ready {
                        self.transition(svc, SvcState::Running);
                        conds.set(&svc.ready_cond());
                        return true;
                    }
                }
                // One-shots stay STARTING until the reaper sees their exit.
            }
            SvcState::Running => {
                if !eligible || verdict == Verdict::Off || svc.dirty {
                    self.stop_child(svc, conds, conf.stop_grace);
                    return true;
                }
                if let Verdict::Flux { hup_ok } = verdict {
                    if hup_ok {
                        if !svc.hupped {
                            debug!("signalling {} to reload", svc.spec.name);
                            let _ = spawn::kill_pid(svc.pid, Signal::SIGHUP);
                            svc.hupped = true;
                            return true;
                        }
                    } else {
                        self.stop_child(svc, conds, conf.stop_grace);
                        return true;
                    }
                }
                if verdict == Verdict::Ok && svc.hupped {
                    svc.hupped = false;
                }
            }
            SvcState::Stopping => {
                // Awaiting the reaper; SIGKILL escalation runs on a timer.
            }
            SvcState::Crashed => {
                if svc.spec.kind.is_oneshot() {
                    // Spawn failures of one-shots have nothing to respawn.
                    self.transition(svc, SvcState::Done);
                    return true;
                }
                if !eligible {
                    self.transition(svc, SvcState::Halted);
                    return true;
                }
                if svc.restarts >= self.instability_threshold {
                    warn!(
                        "{} is unstable ({} crashes), blocking",
                        svc.spec.name, svc.restarts
                    );
                    self.transition(svc, SvcState::Blocked);
                    return true;
                }
                let next = if verdict == Verdict::Ok {
                    SvcState::Ready
                } else {
                    SvcState::Waiting
                };
                self.transition(svc, next);
                return true;
            }
            SvcState::Blocked => {
                // Released by an external clear (client start, reload
                // dirtying the service) or by leaving the runlevel.
                if !eligible {
                    svc.restarts = 0;
                    svc.last_crash = None;
                    self.transition(svc, SvcState::Halted);
                    return true;
                }
            }
            SvcState::Done => {
                if svc.dirty {
                    svc.dirty = false;
                    if eligible
                        && matches!(svc.spec.kind, SvcKind::Task | SvcKind::Run | SvcKind::Sysv)
                    {
                        self.transition(svc, SvcState::Waiting);
                        return true;
                    }
                }
                if !eligible {
                    self.transition(svc, SvcState::Halted);
                    return true;
                }
            }
        }

        false
    }

    fn transition(&mut self, svc: &mut Svc, next: SvcState) {
        debug!(
            "{}:{} {} -> {}",
            svc.spec.name,
            svc.spec.id,
            svc.state.as_ref(),
            next.as_ref()
        );
        svc.state = next;
    }

    /// Sends the stop signal and enters STOPPING; readiness drops at once so
    /// dependent services gate immediately.
    fn stop_child(&mut self, svc: &mut Svc, conds: &mut CondStore, grace: Duration) {
        conds.clear(&svc.ready_cond());
        if svc.pid > 0 {
            let _ = spawn::kill_pid(svc.pid, Signal::SIGTERM);
            self.kill_pending.push(KillEnt {
                pid: svc.pid,
                deadline: Instant::now() + grace,
            });
            self.transition(svc, SvcState::Stopping);
        } else {
            self.transition(svc, SvcState::Halted);
        }
    }

    fn crash(&mut self, svc: &mut Svc) {
        let now = Instant::now();
        let in_window = svc
            .last_crash
            .is_some_and(|last| now.duration_since(last) < self.instability_window);
        svc.restarts = if in_window { svc.restarts + 1 } else { 1 };
        svc.last_crash = Some(now);
        self.transition(svc, SvcState::Crashed);
    }

    /// Reaps exited children and applies their exit transitions. As PID 1
    /// every child on the system is drained; otherwise only registered pids
    /// are waited for, so embedding processes (tests) are unaffected.
    ///
    /// Returns true when any service changed; the caller follows up with
    /// [`Sched::step_all`] and removes entries slated for deletion.
    pub fn reap(&mut self, registry: &mut Registry, conds: &mut CondStore) -> bool {
        let mut changed = false;

        if nix::unistd::getpid().as_raw() == 1 {
            loop {
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(WaitStatus::Exited(pid, code)) => {
                        changed |=
                            self.handle_exit(registry, conds, pid.as_raw(), Some(code), None);
                    }
                    Ok(WaitStatus::Signaled(pid, signal, _)) => {
                        changed |= self.handle_exit(
                            registry,
                            conds,
                            pid.as_raw(),
                            None,
                            Some(signal),
                        );
                    }
                    Ok(_) => {}
                    Err(nix::errno::Errno::ECHILD) => break,
                    Err(errno) => {
                        warn!("waitpid failed: {errno}");
                        break;
                    }
                }
            }
            return changed;
        }

        let pids: Vec<i32> = registry
            .iter()
            .filter(|svc| svc.pid > 0)
            .map(|svc| svc.pid)
            .collect();
        for pid in pids {
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    changed |= self.handle_exit(registry, conds, pid, Some(code), None);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    changed |= self.handle_exit(registry, conds, pid, None, Some(signal));
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    // Already collected elsewhere; treat as clean exit.
                    changed |= self.handle_exit(registry, conds, pid, Some(0), None);
                }
                Err(errno) => warn!("waitpid({pid}) failed: {errno}"),
            }
        }
        changed
    }

    fn handle_exit(
        &mut self,
        registry: &mut Registry,
        conds: &mut CondStore,
        pid: i32,
        code: Option<i32>,
        signal: Option<Signal>,
    ) -> bool {
        self.kill_pending.retain(|ent| ent.pid != pid);

        let Some(index) = registry.find_by_pid(pid) else {
            // Orphan inherited by PID 1; nothing of ours.
            return false;
        };
        let svc = registry.get_mut(index).expect("index from find_by_pid");

        svc.pid = 0;
        svc.started = false;
        svc.hupped = false;
        svc.status = code;
        conds.clear(&svc.ready_cond());

        match signal {
            Some(signal) => debug!(
                "{} (pid {pid}) terminated by {signal}",
                svc.spec.name
            ),
            None => debug!(
                "{} (pid {pid}) exited with code {}",
                svc.spec.name,
                code.unwrap_or(0)
            ),
        }

        match svc.state {
            SvcState::Stopping => {
                self.transition(svc, SvcState::Halted);
            }
            SvcState::Starting | SvcState::Running => {
                if svc.spec.kind.is_oneshot() && code == Some(0) {
                    self.transition(svc, SvcState::Done);
                } else if svc.spec.kind.is_oneshot() {
                    info!(
                        "{} failed with code {:?}, signal {:?}",
                        svc.spec.name, code, signal
                    );
                    self.crash(svc);
                } else {
                    self.crash(svc);
                }
            }
            _ => {
                self.transition(svc, SvcState::Halted);
            }
        }
        true
    }

    /// Blocking wait for one child. Only the bootstrap sequence uses this,
    /// for `run` declarations that gate the boot; steady state always reaps
    /// via WNOHANG.
    pub fn wait_pid_blocking(
        &mut self,
        registry: &mut Registry,
        conds: &mut CondStore,
        pid: i32,
    ) {
        loop {
            match waitpid(Pid::from_raw(pid), None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.handle_exit(registry, conds, pid, Some(code), None);
                    return;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.handle_exit(registry, conds, pid, None, Some(signal));
                    return;
                }
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => {}
                Err(_) => return,
            }
        }
    }

    /// Deadline of the earliest pending SIGKILL escalation, if any.
    pub fn next_kill_deadline(&self) -> Option<Instant> {
        self.kill_pending.iter().map(|ent| ent.deadline).min()
    }

    /// Sends SIGKILL to every child whose stop grace expired.
    pub fn escalate_kills(&mut self) {
        let now = Instant::now();
        for ent in &self.kill_pending {
            if ent.deadline <= now {
                warn!("pid {} ignored SIGTERM, killing", ent.pid);
                let _ = spawn::kill_pid(ent.pid, Signal::SIGKILL);
            }
        }
        self.kill_pending.retain(|ent| ent.deadline > now);
    }

    /// Periodic tick: decays every instability counter by one.
    pub fn tick(&mut self, registry: &mut Registry) {
        for svc in registry.iter_mut() {
            svc.restarts = svc.restarts.saturating_sub(1);
        }
    }

    /// Atomically changes runlevel and re-evaluates every service: first the
    /// stop set (old mask ∖ new mask) leaves via STOPPING, then the start set
    /// is stepped in.
    pub fn enter_runlevel(
        &mut self,
        registry: &mut Registry,
        conds: &mut CondStore,
        conf: &Conf,
        cgroups: &CgroupTable,
        level: u8,
    ) {
        if level == self.runlevel {
            return;
        }
        info!("Switching to runlevel {level}");
        self.prevlevel = self.runlevel;
        self.runlevel = level;
        self.step_all(registry, conds, conf, cgroups, KIND_ALL);
    }

    /// Manual start: clears the stop latch and releases a BLOCKED service.
    pub fn svc_start(&mut self, svc: &mut Svc) {
        svc.stopped_by_user = false;
        if svc.state == SvcState::Blocked {
            svc.restarts = 0;
            svc.last_crash = None;
            self.transition(svc, SvcState::Halted);
        }
    }

    /// Manual stop: the service stays down until started again.
    pub fn svc_stop(&mut self, svc: &mut Svc) {
        svc.stopped_by_user = true;
    }

    /// Manual restart: a blocked service is released first, then the dirty
    /// flag forces a stop/start cycle.
    pub fn svc_restart(&mut self, svc: &mut Svc) {
        if svc.state == SvcState::Blocked {
            self.svc_start(svc);
        }
        svc.dirty = true;
    }
}
