#![allow(dead_code)]

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use rinit::{
    cond::CondState,
    runtime,
    supervisor::{Options, Supervisor},
    svc::SvcState,
};

/// Points HOME (and the runtime context) at a scratch directory for the
/// lifetime of the guard. Serialised via the crate's env lock.
pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = rinit::test_utils::env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        rinit::runtime::init(rinit::runtime::RuntimeMode::User);
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var("HOME", value);
            },
            None => unsafe {
                env::remove_var("HOME");
            },
        }
        rinit::runtime::init(rinit::runtime::RuntimeMode::User);
    }
}

/// Writes the primary configuration file.
pub fn write_conf(content: &str) {
    let path = runtime::conf_file();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Writes one rc.d declaration file and returns its path.
pub fn write_rcsd(name: &str, content: &str) -> PathBuf {
    let dir = runtime::rcsd_dir();
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

/// A booted supervisor in user/test mode.
pub fn boot() -> Supervisor {
    boot_with(Options::default())
}

pub fn boot_with(options: Options) -> Supervisor {
    let mut supervisor = Supervisor::new_for_test(options).expect("supervisor setup");
    supervisor.bootstrap().expect("bootstrap");
    supervisor
}

/// Drives plugins + reaper + scheduler until `predicate` holds.
pub fn settle<F: Fn(&Supervisor) -> bool>(supervisor: &mut Supervisor, predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        supervisor.pump_plugins();
        supervisor.reap_and_step();
        supervisor.sched.escalate_kills();
        if predicate(supervisor) {
            return;
        }
        assert!(Instant::now() < deadline, "supervisor did not settle");
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn state_of(supervisor: &Supervisor, name: &str) -> SvcState {
    supervisor
        .registry
        .find(name, "")
        .unwrap_or_else(|| panic!("service {name} not registered"))
        .state
}

pub fn pid_of(supervisor: &Supervisor, name: &str) -> i32 {
    supervisor.registry.find(name, "").expect("service").pid
}

pub fn is_process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// The quantified invariants from the design, checked after settling.
pub fn assert_invariants(supervisor: &Supervisor) {
    for svc in supervisor.registry.iter() {
        if svc.pid != 0 {
            assert!(
                matches!(
                    svc.state,
                    SvcState::Starting | SvcState::Running | SvcState::Stopping
                ),
                "{} has pid {} in state {:?}",
                svc.spec.name,
                svc.pid,
                svc.state
            );
        }
        if svc.state == SvcState::Running {
            assert_eq!(
                supervisor.conds.get(&svc.ready_cond()),
                CondState::On,
                "{} running without ready condition",
                svc.spec.name
            );
        }
        if !svc.eligible(supervisor.sched.runlevel) {
            assert!(
                matches!(svc.state, SvcState::Halted | SvcState::Stopping),
                "{} ineligible but in state {:?}",
                svc.spec.name,
                svc.state
            );
        }
    }
}
