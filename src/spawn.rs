//! fork/exec of service children and external helper commands.
//!
//! Children get a scrubbed environment, a fresh session, their declared
//! resource limits and credentials, and output redirection per the service's
//! log policy. Nothing is inherited from the supervisor beyond stdio (when
//! requested) and the environment snapshot taken at fork.

use std::{
    fs,
    os::unix::process::CommandExt,
    path::Path,
    process::{Command, Stdio},
};

use nix::{
    sys::{
        resource::{Resource, getrlimit, setrlimit},
        signal::Signal,
    },
    unistd::{Group, Pid, User, setsid},
};
use tracing::{debug, warn};

use crate::{
    cgroup::CgroupTable,
    conf::{Conf, LimitValue, RlimitLevel, RlimitRule},
    constants::{EXEC_PATH, EXEC_SHELL, EXEC_USER},
    error::SpawnError,
    runtime,
    svc::{LogPolicy, Svc},
};

/// Maps an `rlimit` directive resource name to the kernel resource.
pub fn resource_by_name(name: &str) -> Option<Resource> {
    let resource = match name {
        "as" => Resource::RLIMIT_AS,
        "core" => Resource::RLIMIT_CORE,
        "cpu" => Resource::RLIMIT_CPU,
        "data" => Resource::RLIMIT_DATA,
        "fsize" => Resource::RLIMIT_FSIZE,
        "locks" => Resource::RLIMIT_LOCKS,
        "memlock" => Resource::RLIMIT_MEMLOCK,
        "msgqueue" => Resource::RLIMIT_MSGQUEUE,
        "nice" => Resource::RLIMIT_NICE,
        "nofile" => Resource::RLIMIT_NOFILE,
        "nproc" => Resource::RLIMIT_NPROC,
        "rss" => Resource::RLIMIT_RSS,
        "rtprio" => Resource::RLIMIT_RTPRIO,
        "rttime" => Resource::RLIMIT_RTTIME,
        "sigpending" => Resource::RLIMIT_SIGPENDING,
        "stack" => Resource::RLIMIT_STACK,
        _ => return None,
    };
    Some(resource)
}

fn limit_value(value: LimitValue) -> u64 {
    match value {
        LimitValue::Fixed(v) => v,
        LimitValue::Unlimited => nix::sys::resource::RLIM_INFINITY,
    }
}

/// Applies one rlimit rule to the calling process.
fn apply_rlimit(rule: &RlimitRule) -> nix::Result<()> {
    let Some(resource) = resource_by_name(&rule.resource) else {
        return Ok(());
    };
    let (mut soft, mut hard) = getrlimit(resource)?;
    let value = limit_value(rule.value);

    match rule.level {
        RlimitLevel::Soft => soft = value,
        RlimitLevel::Hard => hard = value,
        RlimitLevel::Both => {
            soft = value;
            hard = value;
        }
    }
    setrlimit(resource, soft, hard)
}

/// Applies the global rlimit rules to the supervisor itself. Failures are
/// logged and ignored.
pub fn apply_rlimits(rules: &[RlimitRule]) {
    for rule in rules {
        if let Err(errno) = apply_rlimit(rule) {
            warn!("rlimit: failed setting {}: {errno}", rule.resource);
        }
    }
}

/// Resolves the declared credentials to numeric ids.
fn resolve_credentials(
    user: Option<&str>,
    group: Option<&str>,
) -> Result<(Option<u32>, Option<u32>), SpawnError> {
    let uid = match user {
        Some(name) => match User::from_name(name) {
            Ok(Some(user)) => Some(user.uid.as_raw()),
            _ => return Err(SpawnError::UnknownCredentials(name.to_string())),
        },
        None => None,
    };
    let gid = match group {
        Some(name) => match Group::from_name(name) {
            Ok(Some(group)) => Some(group.gid.as_raw()),
            _ => return Err(SpawnError::UnknownCredentials(name.to_string())),
        },
        None => None,
    };
    Ok((uid, gid))
}

/// Opens (rotating first if needed) the redirection target for a service.
fn open_log(svc: &Svc, conf: &Conf) -> std::io::Result<fs::File> {
    let dir = runtime::log_dir();
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.log", svc.spec.name));
    rotate_log(&path, conf.log_size, conf.log_count);
    fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Size-triggered rotation: `name.log` -> `name.log.1` -> ... -> `name.log.N`.
fn rotate_log(path: &Path, max_size: u64, count: u32) {
    let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    if size < max_size || count == 0 {
        return;
    }

    let name = path.display();
    let _ = fs::remove_file(format!("{name}.{count}"));
    for index in (1..count).rev() {
        let _ = fs::rename(format!("{name}.{index}"), format!("{name}.{}", index + 1));
    }
    let _ = fs::rename(path, format!("{name}.1"));
}

/// Forks and execs the service command. Returns the child pid.
pub fn spawn_svc(
    svc: &Svc,
    conf: &Conf,
    cgroups: &CgroupTable,
) -> Result<i32, SpawnError> {
    let mut cmd = Command::new(&svc.spec.cmd);
    cmd.args(&svc.spec.args);

    cmd.env_clear();
    cmd.env("PATH", EXEC_PATH);
    cmd.env("SHELL", EXEC_SHELL);
    cmd.env("LOGNAME", EXEC_USER);
    cmd.env("USER", EXEC_USER);
    for (key, value) in &conf.env {
        cmd.env(key, value);
    }

    if let Some(dir) = &svc.spec.workdir {
        cmd.current_dir(dir);
    }

    let (uid, gid) = resolve_credentials(
        svc.spec.user.as_deref(),
        svc.spec.group.as_deref(),
    )?;
    if let Some(gid) = gid {
        cmd.gid(gid);
    }
    if let Some(uid) = uid {
        cmd.uid(uid);
    }

    match svc.spec.log {
        LogPolicy::Null => {
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        }
        LogPolicy::Console => {
            cmd.stdin(Stdio::null());
        }
        LogPolicy::File => {
            let file = open_log(svc, conf).map_err(|source| SpawnError::Start {
                service: svc.spec.name.clone(),
                source,
            })?;
            let err = file.try_clone().map_err(|source| SpawnError::Start {
                service: svc.spec.name.clone(),
                source,
            })?;
            cmd.stdin(Stdio::null());
            cmd.stdout(file);
            cmd.stderr(err);
        }
    }

    let rlimits = svc.spec.rlimits.clone();
    // Safety: the closure only calls async-signal-safe-adjacent syscalls
    // (setsid, setrlimit) before exec.
    unsafe {
        cmd.pre_exec(move || {
            let _ = setsid();
            for rule in &rlimits {
                let _ = apply_rlimit(rule);
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| SpawnError::Start {
        service: svc.spec.name.clone(),
        source,
    })?;
    let pid = child.id() as i32;
    // The child is reaped via waitpid(2), never via the handle.
    drop(child);

    if let Some(dir) = cgroups.dir_for(&svc.spec.cgroup) {
        if let Err(err) = fs::write(dir.join("cgroup.procs"), pid.to_string()) {
            warn!(
                "Failed attaching {} (pid {pid}) to cgroup {}: {err}",
                svc.spec.name, svc.spec.cgroup
            );
        }
    }

    debug!("spawned {} as pid {pid}", svc.spec.name);
    Ok(pid)
}

/// Delivers `signal` to `pid`. A vanished process is not an error.
pub fn kill_pid(pid: i32, signal: Signal) -> Result<(), SpawnError> {
    match nix::sys::signal::kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(SpawnError::Signal { pid, errno }),
    }
}

/// Runs an external helper command to completion, returning its exit code.
///
/// Used for bootstrap helpers (network script, runparts, modprobe, mknod)
/// and the shutdown helper; blocking here is permitted, steady-state code
/// never calls this.
pub fn run(cmdline: &str) -> std::io::Result<i32> {
    let argv = crate::conf::tokenize(cmdline);
    if argv.is_empty() {
        return Ok(0);
    }

    debug!("run: {cmdline}");
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    // A signal death must not read as success.
    Ok(status.code().unwrap_or(1))
}
