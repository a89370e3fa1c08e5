//! Declarative configuration: parser, environment files and change watcher.
//!
//! The format is line-oriented UTF-8; `#` starts a comment, tabs count as
//! spaces. Global directives mutate [`Conf`], dynamic directives register
//! services and cgroups. Bad lines are logged and skipped; parsing always
//! continues.

use std::{
    collections::{HashMap, HashSet},
    fs,
    os::fd::{AsFd, AsRawFd, RawFd},
    path::{Path, PathBuf},
    time::Duration,
};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tracing::{debug, warn};

use crate::{
    cgroup::CgroupTable,
    cond::CondAtom,
    constants::{
        DEFAULT_LOG_COUNT, DEFAULT_LOG_SIZE, DEFAULT_RUNLEVEL, DEFAULT_RUNLEVELS,
        DEFAULT_STOP_GRACE, SERVICE_INTERVAL_MAX,
    },
    error::ConfError,
    runtime,
    svc::{LogPolicy, Registry, SvcKind, SvcSpec},
};

/// Resource names accepted by the `rlimit` directive.
pub const RLIMIT_NAMES: &[&str] = &[
    "as",
    "core",
    "cpu",
    "data",
    "fsize",
    "locks",
    "memlock",
    "msgqueue",
    "nice",
    "nofile",
    "nproc",
    "rss",
    "rtprio",
    "rttime",
    "sigpending",
    "stack",
];

/// Which limit of a resource a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RlimitLevel {
    Soft,
    Hard,
    Both,
}

/// Value accepted for an rlimit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitValue {
    /// A fixed numeric limit.
    Fixed(u64),
    /// Unlimited (maps to `RLIM_INFINITY`).
    Unlimited,
}

/// One parsed `rlimit` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RlimitRule {
    pub resource: String,
    pub level: RlimitLevel,
    pub value: LimitValue,
}

impl RlimitRule {
    /// Parses `rlimit [soft|hard|both] RESOURCE <value|unlimited|infinity>`,
    /// the two-token form defaulting to `both`.
    pub fn parse(rest: &str) -> Option<Self> {
        let mut tokens = rest.split_whitespace();
        let first = tokens.next()?;
        let second = tokens.next()?;

        let (level, resource, value) = match tokens.next() {
            Some(third) => {
                let level = match first {
                    "soft" => RlimitLevel::Soft,
                    "hard" => RlimitLevel::Hard,
                    "both" => RlimitLevel::Both,
                    _ => return None,
                };
                (level, second, third)
            }
            None => (RlimitLevel::Both, first, second),
        };

        if !RLIMIT_NAMES.contains(&resource) {
            return None;
        }

        let value = if value == "unlimited" || value == "infinity" {
            LimitValue::Unlimited
        } else {
            LimitValue::Fixed(value.parse().ok()?)
        };

        Some(RlimitRule {
            resource: resource.to_string(),
            level,
            value,
        })
    }

    /// Stable byte form folded into the service declaration digest.
    pub fn digest_bytes(&self) -> Vec<u8> {
        let value = match self.value {
            LimitValue::Fixed(v) => v.to_string(),
            LimitValue::Unlimited => "unlimited".to_string(),
        };
        format!("rlimit:{}:{:?}:{value};", self.resource, self.level).into_bytes()
    }
}

/// Global configuration owned by the supervisor and passed by reference.
#[derive(Debug, Clone)]
pub struct Conf {
    /// Runlevel to enter when leaving bootstrap.
    pub runlevel: u8,
    pub hostname: Option<String>,
    /// Path of the network bring-up helper script.
    pub network: Option<String>,
    /// Path of the rc.local-style runparts directory or script.
    pub runparts: Option<String>,
    /// Path of the shutdown helper run at runlevel 0/6.
    pub shutdown: Option<String>,
    /// Kernel modules to load during bootstrap.
    pub modules: Vec<String>,
    /// Device nodes to create during bootstrap.
    pub mknod: Vec<String>,
    /// Log rotation size for redirected service output, bytes.
    pub log_size: u64,
    /// Number of rotated log files kept.
    pub log_count: u32,
    /// Global resource limits, applied to the supervisor and inherited.
    pub rlimits: Vec<RlimitRule>,
    /// Periodic tick in seconds; 0 keeps the previous period (re-arming a
    /// disabled tick).
    pub service_interval: u64,
    /// Grace between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Global `KEY=VALUE` environment assignments from config and env files.
    pub env: Vec<(String, String)>,
    pub rescue: bool,
    pub single: bool,
    pub debug: bool,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            runlevel: DEFAULT_RUNLEVEL,
            hostname: None,
            network: None,
            runparts: None,
            shutdown: None,
            modules: Vec::new(),
            mknod: Vec::new(),
            log_size: DEFAULT_LOG_SIZE,
            log_count: DEFAULT_LOG_COUNT,
            rlimits: Vec::new(),
            service_interval: crate::constants::DEFAULT_SERVICE_INTERVAL.as_secs(),
            stop_grace: DEFAULT_STOP_GRACE,
            env: Vec::new(),
            rescue: false,
            single: false,
            debug: false,
        }
    }
}

impl Conf {
    /// Resets the reload-scoped parts: env table, helper paths and rlimits
    /// return to their defaults before re-parsing.
    pub fn reset_for_reload(&mut self) {
        self.env.clear();
        self.rlimits.clear();
        self.modules.clear();
        self.mknod.clear();
        self.log_size = DEFAULT_LOG_SIZE;
        self.log_count = DEFAULT_LOG_COUNT;
    }
}

/// Converts an optional `[!0-9sS]` token into a runlevel bitmask.
pub fn parse_runlevels(token: Option<&str>) -> u16 {
    let Some(token) = token else {
        return DEFAULT_RUNLEVELS;
    };

    let inner = token.trim_start_matches('[').trim_end_matches(']');
    let mut invert = false;
    let mut mask: u16 = 0;

    for ch in inner.chars() {
        let level = match ch {
            '!' => {
                invert = true;
                mask = 0x3FE; /* levels 1..9 */
                continue;
            }
            's' | 'S' => 1,
            '0'..='9' => ch as u8 - b'0',
            _ => continue,
        };
        if invert {
            mask &= !(1u16 << level);
        } else {
            mask |= 1u16 << level;
        }
    }

    mask
}

/// Splits a command line into tokens, honouring single and double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Parses one `KEY=VALUE` line from an environment file or a .conf global.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }

    let mut value = value.trim();
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            value = &value[1..value.len() - 1];
        }
    }

    Some((key.to_string(), value.to_string()))
}

/// Drives one full configuration parse into the supervisor tables.
pub struct Loader<'a> {
    pub conf: &'a mut Conf,
    pub registry: &'a mut Registry,
    pub cgroups: &'a mut CgroupTable,
    /// First boot: bootstrap-only directives are honoured.
    pub bootstrap: bool,
}

impl<'a> Loader<'a> {
    pub fn new(
        conf: &'a mut Conf,
        registry: &'a mut Registry,
        cgroups: &'a mut CgroupTable,
        bootstrap: bool,
    ) -> Self {
        Loader {
            conf,
            registry,
            cgroups,
            bootstrap,
        }
    }

    /// Reads the primary config file, the rc.d tree and the environment
    /// directories, in that order; later writes shadow earlier ones.
    pub fn load(&mut self) -> Result<(), ConfError> {
        let main = runtime::conf_file();
        if main.exists() {
            self.parse_conf(&main, false)?;
        }

        let rcsd = runtime::rcsd_dir();
        for path in sorted_conf_files(&rcsd) {
            self.parse_conf(&path, true)?;
        }
        for path in sorted_conf_files(&rcsd.join("enabled")) {
            self.parse_conf(&path, true)?;
        }

        for dir in runtime::env_dirs() {
            self.parse_env_dir(&dir);
        }

        Ok(())
    }

    /// Parses one configuration file. `is_rcsd` files start from a private
    /// copy of the global rlimits and a fresh current-cgroup selector.
    pub fn parse_conf(&mut self, file: &Path, is_rcsd: bool) -> Result<(), ConfError> {
        let mut rlimits = if is_rcsd {
            self.conf.rlimits.clone()
        } else {
            Vec::new()
        };
        let mut cgroup_current = String::new();

        debug!("*** parsing {}", file.display());
        let content = match fs::read_to_string(file) {
            Ok(content) => content,
            Err(err) => {
                warn!("Failed to read {}: {err}", file.display());
                return Ok(());
            }
        };

        for raw in content.lines() {
            let line = raw.replace('\t', " ");
            let line = match line.split_once('#') {
                Some((head, _)) => head.trim(),
                None => line.trim(),
            };
            if line.is_empty() {
                continue;
            }

            if self.parse_static(line, is_rcsd)? {
                continue;
            }
            if self.parse_dynamic(line, file, is_rcsd, &mut rlimits, &mut cgroup_current)
            {
                continue;
            }

            // Not a directive; a KEY=VALUE line is a global env assignment.
            match parse_env_line(line) {
                Some((key, value)) => {
                    self.conf.env.retain(|(existing, _)| existing != &key);
                    self.conf.env.push((key, value));
                }
                None => warn!(
                    "Unknown directive in {}, skipping: {line}",
                    file.display()
                ),
            }
        }

        Ok(())
    }

    /// Global directives. Returns true when the line was consumed.
    fn parse_static(&mut self, line: &str, is_rcsd: bool) -> Result<bool, ConfError> {
        let (word, rest) = split_directive(line);

        match word {
            "host" | "hostname" if self.bootstrap => {
                self.conf.hostname = Some(rest.trim().to_string());
            }
            "module" if self.bootstrap => {
                self.conf.modules.push(rest.trim().to_string());
            }
            "mknod" if self.bootstrap => {
                self.conf.mknod.push(rest.trim().to_string());
            }
            "network" if self.bootstrap => {
                self.conf.network = Some(rest.trim().to_string());
            }
            "runparts" if self.bootstrap => {
                self.conf.runparts = Some(rest.trim().to_string());
            }
            "shutdown" => {
                self.conf.shutdown = Some(rest.trim().to_string());
            }
            "include" => {
                let file = rest.trim();
                let path = Path::new(file);
                if !path.is_absolute() || !path.exists() {
                    warn!("Cannot find include file '{file}', absolute path required");
                    return Ok(true);
                }
                self.parse_conf(&path.to_path_buf(), is_rcsd)?;
            }
            "log" => self.parse_log(rest),
            "runlevel" if self.bootstrap => {
                let level = rest.trim().parse::<u8>().unwrap_or(DEFAULT_RUNLEVEL);
                self.conf.runlevel = if (1..=9).contains(&level) && level != 6 {
                    level
                } else {
                    DEFAULT_RUNLEVEL
                };
            }
            "service-interval" => {
                match rest.trim().parse::<u64>() {
                    Ok(value) if value <= SERVICE_INTERVAL_MAX => {
                        self.conf.service_interval = value;
                    }
                    _ => warn!("Invalid service-interval '{}', skipping", rest.trim()),
                }
            }
            _ => return Ok(false),
        }

        Ok(true)
    }

    /// Service, rlimit and cgroup directives. Returns true when consumed.
    fn parse_dynamic(
        &mut self,
        line: &str,
        file: &Path,
        is_rcsd: bool,
        rlimits: &mut Vec<RlimitRule>,
        cgroup_current: &mut String,
    ) -> bool {
        let (word, rest) = split_directive(line);

        let kind = match word {
            "service" => Some(SvcKind::Service),
            "task" => Some(SvcKind::Task),
            "run" => Some(SvcKind::Run),
            "sysv" => Some(SvcKind::Sysv),
            "tty" => Some(SvcKind::Tty),
            _ => None,
        };
        if let Some(kind) = kind {
            match parse_decl(kind, rest, file, rlimits, cgroup_current) {
                Some(spec) => {
                    self.registry.register(spec);
                }
                None => warn!("Bad {word} declaration in {}: {line}", file.display()),
            }
            return true;
        }

        if word == "rlimit" {
            match RlimitRule::parse(rest) {
                Some(rule) => {
                    if is_rcsd {
                        rlimits.push(rule);
                    } else {
                        self.conf.rlimits.push(rule.clone());
                        rlimits.push(rule);
                    }
                }
                None => warn!("rlimit: parse error: {line}"),
            }
            return true;
        }

        if word == "cgroup" {
            let mut tokens = rest.split_whitespace();
            if let Some(name) = tokens.next() {
                let props = tokens.collect::<Vec<_>>().join(",");
                self.cgroups.add(name, &props);
            }
            return true;
        }

        if let Some(name) = word.strip_prefix("cgroup.") {
            *cgroup_current = name.to_string();
            return true;
        }

        false
    }

    fn parse_log(&mut self, rest: &str) {
        for token in rest.split([' ', ',']) {
            let token = token.trim();
            if let Some(value) = token.strip_prefix("size:") {
                match value.parse() {
                    Ok(size) => self.conf.log_size = size,
                    Err(_) => warn!("log: invalid size '{value}'"),
                }
            } else if let Some(value) = token.strip_prefix("count:") {
                match value.parse() {
                    Ok(count) => self.conf.log_count = count,
                    Err(_) => warn!("log: invalid count '{value}'"),
                }
            }
        }
    }

    fn parse_env_dir(&mut self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        for file in files {
            let Ok(content) = fs::read_to_string(&file) else {
                warn!("Failed to read env file {}", file.display());
                continue;
            };
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = parse_env_line(line) {
                    self.conf.env.retain(|(existing, _)| existing != &key);
                    self.conf.env.push((key, value));
                } else {
                    warn!(
                        "Ignoring malformed line in env file {}: {line}",
                        file.display()
                    );
                }
            }
        }
    }
}

/// Splits `"service [234] ..."` into the directive word and its remainder.
fn split_directive(line: &str) -> (&str, &str) {
    match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (line, ""),
    }
}

/// Parses one service/task/run/sysv/tty declaration into a [`SvcSpec`].
///
/// Grammar: decoration tokens in any order before the command, then the
/// command line, then an optional `-- description`:
///
/// ```text
/// service [S12345] <!service/net/ready,usr/x> name:foo :2 cgroup.sys: \
///         @user:group log /sbin/food -n -P /run/food.pid -- Foo daemon
/// ```
pub fn parse_decl(
    kind: SvcKind,
    rest: &str,
    file: &Path,
    rlimits: &[RlimitRule],
    cgroup_current: &str,
) -> Option<SvcSpec> {
    let tokens = tokenize(rest);
    let mut runlevels = DEFAULT_RUNLEVELS;
    let mut cond = Vec::new();
    let mut sighup = kind.is_daemon();
    let mut name: Option<String> = None;
    let mut id = String::new();
    let mut cgroup = cgroup_current.to_string();
    let mut user = None;
    let mut group = None;
    let mut log = LogPolicy::Null;
    let mut cmdline: Vec<String> = Vec::new();
    let mut descr = Vec::new();
    let mut in_descr = false;

    for token in tokens {
        if in_descr {
            descr.push(token);
            continue;
        }
        if token == "--" {
            in_descr = true;
            continue;
        }
        if !cmdline.is_empty() {
            cmdline.push(token);
            continue;
        }

        if token.starts_with('[') {
            runlevels = parse_runlevels(Some(&token));
        } else if token.starts_with('<') {
            let inner = token.trim_start_matches('<').trim_end_matches('>');
            let inner = match inner.strip_prefix('!') {
                Some(stripped) => {
                    sighup = false;
                    stripped
                }
                None => inner,
            };
            for atom in inner.split(',') {
                if let Some(atom) = CondAtom::parse(atom) {
                    cond.push(atom);
                }
            }
        } else if let Some(value) = token.strip_prefix("name:") {
            name = Some(value.to_string());
        } else if let Some(value) = token.strip_prefix(':') {
            id = value.to_string();
        } else if let Some(value) = token.strip_prefix("cgroup.") {
            cgroup = value.trim_end_matches(':').to_string();
        } else if let Some(value) = token.strip_prefix('@') {
            match value.split_once(':') {
                Some((u, g)) => {
                    user = Some(u.to_string());
                    group = Some(g.to_string());
                }
                None => user = Some(value.to_string()),
            }
        } else if token == "log" {
            log = LogPolicy::File;
        } else {
            cmdline.push(token);
        }
    }

    if cmdline.is_empty() {
        return None;
    }

    let cmd = PathBuf::from(cmdline.remove(0));
    let name = name.unwrap_or_else(|| {
        cmd.file_name()
            .map(|base| base.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    if name.is_empty() {
        return None;
    }

    // A `-P <path>` in the argv declares the pidfile; the argument stays in
    // place for the child itself.
    let pidfile = cmdline
        .iter()
        .position(|arg| arg == "-P")
        .and_then(|index| cmdline.get(index + 1))
        .map(PathBuf::from);

    Some(SvcSpec {
        kind,
        name,
        id,
        runlevels,
        cond,
        sighup,
        cmd,
        args: cmdline,
        workdir: None,
        user,
        group,
        rlimits: rlimits.to_vec(),
        cgroup,
        pidfile,
        log,
        descr: descr.join(" "),
        file: Some(file.to_path_buf()),
        protected: false,
    })
}

/// Returns the `.conf` files in `dir`, sorted by name. Directories and
/// dangling symlinks are skipped.
fn sorted_conf_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            if path.extension().is_none_or(|ext| ext != "conf") {
                return false;
            }
            // metadata() follows symlinks, so dangling links drop out here.
            match fs::metadata(path) {
                Ok(meta) => meta.is_file(),
                Err(err) => {
                    debug!("Skipping {}: {err}", path.display());
                    false
                }
            }
        })
        .collect();
    files.sort();
    files
}

/// Inotify watcher accumulating the set of changed configuration paths.
pub struct ConfWatcher {
    inotify: Inotify,
    wds: HashMap<WatchDescriptor, PathBuf>,
    changes: HashSet<PathBuf>,
}

impl ConfWatcher {
    /// Watches the config file, the rc.d tree and the env directories.
    /// Individual missing paths are tolerated.
    pub fn new() -> Result<Self, ConfError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(ConfError::Watch)?;

        let mut watcher = ConfWatcher {
            inotify,
            wds: HashMap::new(),
            changes: HashSet::new(),
        };

        let rcsd = runtime::rcsd_dir();
        let mut paths = vec![
            runtime::config_dir(),
            rcsd.clone(),
            rcsd.join("available"),
            rcsd.join("enabled"),
        ];
        paths.extend(runtime::env_dirs());

        for path in paths {
            watcher.watch(&path);
        }
        Ok(watcher)
    }

    fn watch(&mut self, path: &Path) {
        let mask = AddWatchFlags::IN_CREATE
            | AddWatchFlags::IN_MODIFY
            | AddWatchFlags::IN_ATTRIB
            | AddWatchFlags::IN_DELETE
            | AddWatchFlags::IN_MOVED_TO
            | AddWatchFlags::IN_MOVED_FROM;

        match self.inotify.add_watch(path, mask) {
            Ok(wd) => {
                self.wds.insert(wd, path.to_path_buf());
            }
            Err(err) => debug!("Not watching {}: {err}", path.display()),
        }
    }

    /// Descriptor to register with the event loop.
    pub fn fd(&self) -> RawFd {
        self.inotify.as_fd().as_raw_fd()
    }

    /// Drains pending inotify events into the change set. Deleted files drop
    /// out of the set again.
    pub fn handle_events(&mut self) {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EAGAIN) => return,
            Err(err) => {
                warn!("invalid inotify event: {err}");
                return;
            }
        };

        for event in events {
            let Some(dir) = self.wds.get(&event.wd) else {
                continue;
            };
            let Some(name) = &event.name else { continue };
            let path = dir.join(name);

            if event
                .mask
                .intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM)
            {
                self.changes.remove(&path);
                continue;
            }

            debug!("config change registered for {}", path.display());
            self.changes.insert(path);
        }
    }

    /// True when any tracked file changed since the last drop.
    pub fn any_change(&self) -> bool {
        !self.changes.is_empty()
    }

    /// True when `path` is in the current change set.
    pub fn changed(&self, path: &Path) -> bool {
        self.changes.contains(path)
    }

    /// Empties the change set. Idempotent.
    pub fn drop_changes(&mut self) {
        self.changes.clear();
    }
}
