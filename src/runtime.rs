//! Helpers for resolving runtime paths based on the current privilege mode.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

use crate::constants::{API_SOCKET_NAME, CONF_FILE, CONF_RCSD, SUPERVISOR_PID_NAME};

/// Runtime mode that determines where state, conditions and logs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Userspace mode; state lives under the invoking user's home directory.
    /// Used for development and the test suite.
    User,
    /// System mode; the supervisor runs as process 1 (or pretends to) and
    /// state is stored in the canonical system directories.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    config_dir: PathBuf,
    env_dirs: Vec<PathBuf>,
    cgroup_root: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/rinit");

        Self {
            mode: RuntimeMode::User,
            run_dir: state_dir.join("run"),
            log_dir: state_dir.join("logs"),
            config_dir: home.join(".config/rinit"),
            env_dirs: vec![home.join(".config/rinit/default")],
            cgroup_root: state_dir.join("cgroup"),
            state_dir,
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/run/rinit"),
            run_dir: PathBuf::from("/run"),
            log_dir: PathBuf::from("/var/log/rinit"),
            config_dir: PathBuf::from("/etc"),
            env_dirs: vec![PathBuf::from("/etc/default"), PathBuf::from("/etc/conf.d")],
            cgroup_root: PathBuf::from("/sys/fs/cgroup/rinit"),
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent
/// calls overwrite the active configuration so tests and re-execs can switch
/// contexts within the same process.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_mode(mode);
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .mode
}

/// Returns the root directory for supervisor state (socket, pidfile, conditions).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Returns the directory watched for service pidfiles.
pub fn run_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .run_dir
        .clone()
}

/// Returns the directory where redirected service output is written.
pub fn log_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .log_dir
        .clone()
}

/// Returns the directory holding the primary config file and the rc.d tree.
pub fn config_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .config_dir
        .clone()
}

/// Returns the directories scanned for `KEY=VALUE` environment files.
pub fn env_dirs() -> Vec<PathBuf> {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .env_dirs
        .clone()
}

/// Returns the root of the managed cgroup tree.
pub fn cgroup_root() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .cgroup_root
        .clone()
}

/// Returns the path of the primary configuration file.
pub fn conf_file() -> PathBuf {
    config_dir().join(CONF_FILE)
}

/// Returns the rc.d directory scanned for `*.conf` declarations.
pub fn rcsd_dir() -> PathBuf {
    config_dir().join(CONF_RCSD)
}

/// Returns the on-disk root of the condition assertion tree.
pub fn cond_dir() -> PathBuf {
    state_dir().join("cond")
}

/// Returns the UNIX socket path used by API clients.
pub fn api_socket() -> PathBuf {
    state_dir().join(API_SOCKET_NAME)
}

/// Returns the path where the supervisor records its own pid.
pub fn supervisor_pidfile() -> PathBuf {
    state_dir().join(SUPERVISOR_PID_NAME)
}
