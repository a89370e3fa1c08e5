//! Service entities and the insertion-ordered service registry.
//!
//! Services and conditions live in separate tables and reference each other
//! by name/key only; the registry hands out stable `(name, id)` identities
//! and per-name job numbers for the client job-string grammar.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;
use tracing::debug;

use crate::{cond::CondAtom, conf::RlimitRule};

/// Service kind; selects state-machine behaviour.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::AsRefStr,
)]
pub enum SvcKind {
    /// Monitored daemon, respawned on exit.
    Service,
    /// One-shot task, not respawned.
    Task,
    /// One-shot like `Task` but the caller waits for completion.
    Run,
    /// SysV init script wrapper.
    Sysv,
    /// Getty on a terminal device, respawned on exit.
    Tty,
    /// Socket-activated listener registered by a plugin.
    Inetd,
}

impl SvcKind {
    /// True for kinds that stay RUNNING and are respawned on exit.
    pub fn is_daemon(self) -> bool {
        matches!(self, SvcKind::Service | SvcKind::Tty | SvcKind::Inetd)
    }

    /// True for one-shot kinds that go from STARTING to DONE on exit.
    pub fn is_oneshot(self) -> bool {
        matches!(self, SvcKind::Task | SvcKind::Run | SvcKind::Sysv)
    }
}

/// Lifecycle state of a service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::AsRefStr,
)]
pub enum SvcState {
    /// No process; disabled, outside runlevel, or condition OFF.
    Halted,
    /// Eligible by runlevel but condition not yet ON.
    Waiting,
    /// Condition ON, about to fork. Transient.
    Ready,
    /// Child forked; awaiting readiness.
    Starting,
    /// Child alive and ready.
    Running,
    /// Terminating signal sent, awaiting exit.
    Stopping,
    /// Exited abnormally; counted toward instability.
    Crashed,
    /// Instability threshold reached; no restart until cleared.
    Blocked,
    /// One-shot completed.
    Done,
}

/// Output redirection applied to a service child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPolicy {
    /// Discard stdout/stderr.
    Null,
    /// Inherit the supervisor console.
    Console,
    /// Append to a per-service file under the log directory, with rotation.
    File,
}

/// Immutable declaration of a service, as produced by the config parser or a
/// plugin registration.
#[derive(Debug, Clone)]
pub struct SvcSpec {
    pub kind: SvcKind,
    pub name: String,
    pub id: String,
    pub runlevels: u16,
    pub cond: Vec<CondAtom>,
    /// Service understands the config-reload signal (SIGHUP).
    pub sighup: bool,
    pub cmd: PathBuf,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub rlimits: Vec<RlimitRule>,
    pub cgroup: String,
    pub pidfile: Option<PathBuf>,
    pub log: LogPolicy,
    pub descr: String,
    /// Source .conf file; `None` for plugin registrations.
    pub file: Option<PathBuf>,
    /// Registration survives reload even when its file disappears.
    pub protected: bool,
}

impl SvcSpec {
    /// Sha-256 over the normalised declaration; reload compares digests to
    /// decide whether a re-registered service changed.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update([self.kind as u8]);
        hasher.update(self.runlevels.to_le_bytes());
        for atom in &self.cond {
            hasher.update([atom.pinned as u8]);
            hasher.update(atom.key.as_bytes());
            hasher.update([0]);
        }
        hasher.update([self.sighup as u8]);
        hasher.update(self.cmd.as_os_str().as_encoded_bytes());
        for arg in &self.args {
            hasher.update([0]);
            hasher.update(arg.as_bytes());
        }
        if let Some(dir) = &self.workdir {
            hasher.update(dir.as_os_str().as_encoded_bytes());
        }
        hasher.update(self.user.as_deref().unwrap_or("").as_bytes());
        hasher.update([b'@']);
        hasher.update(self.group.as_deref().unwrap_or("").as_bytes());
        for rule in &self.rlimits {
            hasher.update(rule.digest_bytes());
        }
        hasher.update(self.cgroup.as_bytes());
        if let Some(pidfile) = &self.pidfile {
            hasher.update(pidfile.as_os_str().as_encoded_bytes());
        }
        hasher.update([self.log as u8]);
        hasher.update(self.descr.as_bytes());
        hasher.finalize().into()
    }
}

/// A registered service and its mutable lifecycle state.
#[derive(Debug, Clone)]
pub struct Svc {
    /// Job number, shared by all instances of the same name.
    pub job: u32,
    pub spec: SvcSpec,
    pub digest: [u8; 32],

    /// Current lifecycle state.
    pub state: SvcState,
    /// Child pid; 0 when no process is alive.
    pub pid: i32,
    /// Raw wait status of the last exit.
    pub status: Option<i32>,
    /// Instability counter; decays with the periodic tick.
    pub restarts: u32,
    /// Timestamp of the most recent crash, for the sliding window.
    pub last_crash: Option<Instant>,
    /// Wall-clock start of the current child.
    pub started_at: Option<DateTime<Utc>>,
    /// Declaration or dependencies changed; scheduler must re-evaluate.
    pub dirty: bool,
    /// Seen during the current reload parse.
    pub clean: bool,
    /// Slated for registry removal once the child is reaped.
    pub removal: bool,
    /// Readiness latch, set by the pidfile plugin.
    pub started: bool,
    /// Config-reload signal already delivered for the current flux episode.
    pub hupped: bool,
    /// Manually stopped via the client API; ignores runlevel eligibility.
    pub stopped_by_user: bool,
}

impl Svc {
    fn from_spec(job: u32, spec: SvcSpec) -> Self {
        let digest = spec.digest();
        Svc {
            job,
            spec,
            digest,
            state: SvcState::Halted,
            pid: 0,
            status: None,
            restarts: 0,
            last_crash: None,
            started_at: None,
            dirty: false,
            clean: true,
            removal: false,
            started: false,
            hupped: false,
            stopped_by_user: false,
        }
    }

    /// True when the service may run at `runlevel`.
    pub fn eligible(&self, runlevel: u8) -> bool {
        !self.removal
            && !self.stopped_by_user
            && (self.spec.runlevels & (1 << runlevel)) != 0
    }

    /// Name of the condition this service asserts once ready.
    pub fn ready_cond(&self) -> String {
        crate::cond::ready_cond(&self.spec.name, &self.spec.id)
    }

    /// True when the service's condition expression references `key`.
    pub fn references(&self, key: &str) -> bool {
        self.spec.cond.iter().any(|atom| atom.key == key)
    }

    /// Wire/state record handed to API clients.
    pub fn record(&self) -> SvcRecord {
        SvcRecord {
            job: self.job,
            name: self.spec.name.clone(),
            id: self.spec.id.clone(),
            kind: self.spec.kind,
            state: self.state,
            pid: self.pid,
            runlevels: self.spec.runlevels,
            restarts: self.restarts,
            cmd: self.spec.cmd.display().to_string(),
            descr: self.spec.descr.clone(),
        }
    }
}

/// Serialised service record returned by SVC_ITER / SVC_FIND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcRecord {
    pub job: u32,
    pub name: String,
    pub id: String,
    pub kind: SvcKind,
    pub state: SvcState,
    /// `-1` marks the terminal/sentinel record.
    pub pid: i32,
    pub runlevels: u16,
    pub restarts: u32,
    pub cmd: String,
    pub descr: String,
}

impl SvcRecord {
    /// The sentinel record terminating an iteration or a failed find.
    pub fn sentinel() -> Self {
        SvcRecord {
            job: 0,
            name: String::new(),
            id: String::new(),
            kind: SvcKind::Service,
            state: SvcState::Halted,
            pid: -1,
            runlevels: 0,
            restarts: 0,
            cmd: String::new(),
            descr: String::new(),
        }
    }
}

/// Outcome of (re-)registering a service declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// New entry inserted.
    New,
    /// Existing entry, attributes changed; marked dirty.
    Changed,
    /// Existing entry, declaration identical.
    Unchanged,
}

/// Entity table of services. Iteration follows insertion order.
#[derive(Debug)]
pub struct Registry {
    svcs: Vec<Svc>,
    next_job: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            svcs: Vec::new(),
            next_job: 1,
        }
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.svcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.svcs.is_empty()
    }

    /// Registers `spec`, inserting or updating the `(name, id)` entry.
    pub fn register(&mut self, spec: SvcSpec) -> Register {
        if let Some(svc) = self.find_mut(&spec.name, &spec.id) {
            svc.clean = true;
            // A .conf re-declaration never demotes a protected entry.
            let protected = svc.spec.protected || spec.protected;

            let digest = spec.digest();
            if digest != svc.digest {
                debug!("service {}:{} changed, marking dirty", spec.name, spec.id);
                svc.spec = spec;
                svc.spec.protected = protected;
                svc.digest = digest;
                svc.dirty = true;
                return Register::Changed;
            }
            svc.spec.protected = protected;
            return Register::Unchanged;
        }

        let job = self
            .svcs
            .iter()
            .find(|svc| svc.spec.name == spec.name)
            .map(|svc| svc.job)
            .unwrap_or_else(|| {
                let job = self.next_job;
                self.next_job += 1;
                job
            });

        debug!("registered {} {}:{} as job {job}", spec.kind.as_ref(), spec.name, spec.id);
        self.svcs.push(Svc::from_spec(job, spec));
        Register::New
    }

    /// Iterates services in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Svc> {
        self.svcs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Svc> {
        self.svcs.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Svc> {
        self.svcs.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Svc> {
        self.svcs.get_mut(index)
    }

    pub fn find(&self, name: &str, id: &str) -> Option<&Svc> {
        self.svcs
            .iter()
            .find(|svc| svc.spec.name == name && svc.spec.id == id)
    }

    pub fn find_mut(&mut self, name: &str, id: &str) -> Option<&mut Svc> {
        self.svcs
            .iter_mut()
            .find(|svc| svc.spec.name == name && svc.spec.id == id)
    }

    pub fn find_by_pid(&self, pid: i32) -> Option<usize> {
        if pid <= 0 {
            return None;
        }
        self.svcs.iter().position(|svc| svc.pid == pid)
    }

    /// Finds the service whose declared or defaulted pidfile has `file_name`.
    pub fn find_by_pidfile(&self, file_name: &str) -> Option<usize> {
        self.svcs.iter().position(|svc| match &svc.spec.pidfile {
            Some(path) => path
                .file_name()
                .map(|name| name == file_name)
                .unwrap_or(false),
            None => format!("{}{}", svc.spec.name, crate::constants::PIDFILE_SUFFIX)
                == file_name,
        })
    }

    /// Resolves a job-string selector to the indices of matching services.
    pub fn select(&self, selector: &Selector) -> Vec<usize> {
        self.svcs
            .iter()
            .enumerate()
            .filter(|(_, svc)| match selector {
                Selector::Name { name, id } => {
                    svc.spec.name == *name
                        && id.as_ref().is_none_or(|id| svc.spec.id == *id)
                }
                Selector::Job { job, id } => {
                    svc.job == *job && id.as_ref().is_none_or(|id| svc.spec.id == *id)
                }
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Removes the entry at `index`.
    pub fn remove(&mut self, index: usize) -> Svc {
        self.svcs.remove(index)
    }

    /// Reload step 1: mark every entry unseen so the sweep can find entries
    /// whose declaration disappeared.
    pub fn mark_dynamic(&mut self) {
        for svc in &mut self.svcs {
            svc.clean = false;
        }
    }

    /// Reload step 3: slate unseen, unprotected entries for removal and
    /// immediately drop the ones with no live child.
    pub fn sweep(&mut self) {
        for svc in &mut self.svcs {
            if !svc.clean && !svc.spec.protected {
                debug!(
                    "service {}:{} gone from config, removing",
                    svc.spec.name, svc.spec.id
                );
                svc.removal = true;
                svc.dirty = true;
            }
        }
        self.svcs.retain(|svc| !(svc.removal && svc.pid == 0));
    }

    /// Drops entries whose removal was deferred until their child died.
    pub fn purge_removed(&mut self) {
        self.svcs.retain(|svc| !(svc.removal && svc.pid == 0));
    }

    /// Reload step 5: propagate dirtiness to reverse dependencies over
    /// `service/<name>/ready` edges, to a fixed point.
    pub fn propagate_dirty(&mut self) {
        loop {
            let dirty_conds: Vec<String> = self
                .svcs
                .iter()
                .filter(|svc| svc.dirty)
                .map(|svc| svc.ready_cond())
                .collect();

            let mut changed = false;
            for svc in &mut self.svcs {
                if !svc.dirty && dirty_conds.iter().any(|key| svc.references(key)) {
                    svc.dirty = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// One selector from the client job-string grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// `name[:id]`
    Name { name: String, id: Option<String> },
    /// `jobid[:id]`; numeric-leading selectors are job ids.
    Job { job: u32, id: Option<String> },
}

impl Selector {
    /// Parses one selector token; `None` for malformed numeric job ids.
    pub fn parse(token: &str) -> Option<Self> {
        let (head, id) = match token.split_once(':') {
            Some((head, id)) => (head, Some(id.to_string())),
            None => (token, None),
        };
        if head.is_empty() {
            return None;
        }

        if head.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            let job = head.parse::<u32>().ok()?;
            return Some(Selector::Job { job, id });
        }

        Some(Selector::Name {
            name: head.to_string(),
            id,
        })
    }

    /// Formats the selector the way SVC_QUERY reports unmatched entries.
    pub fn unmatched(&self) -> String {
        match self {
            Selector::Name { name, id } => {
                format!("{}:{} ", name, id.as_deref().unwrap_or(""))
            }
            Selector::Job { job, id } => {
                format!("{}:{} ", job, id.as_deref().unwrap_or(""))
            }
        }
    }
}

/// Splits a job-string into selectors. Empty tokens are skipped; tokens that
/// fail to parse are reported as unmatched by the caller.
pub fn parse_jobstr(input: &str) -> Vec<Result<Selector, String>> {
    input
        .split([',', ' ', '\t'])
        .filter(|token| !token.is_empty())
        .map(|token| Selector::parse(token).ok_or_else(|| format!("{token}:")))
        .collect()
}
