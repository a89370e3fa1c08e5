#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, assert_invariants, pid_of, settle, state_of, write_conf};
use rinit::{
    api::Cmd,
    cond::CondState,
    runtime,
    svc::SvcState,
};
use std::fs;
use tempfile::tempdir;

#[test]
fn boot_to_runlevel_two_starts_declared_service() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 2\n\
         service [2345] name:serv /bin/sh -c 'exec sleep 60' -- Test daemon\n",
    );

    let mut sup = common::boot();
    assert_eq!(sup.sched.runlevel, 2);

    settle(&mut sup, |sup| state_of(sup, "serv") == SvcState::Running);
    let pid = pid_of(&sup, "serv");
    assert!(pid > 0);
    assert!(common::is_process_alive(pid));
    assert_eq!(sup.conds.get("service/serv/ready"), CondState::On);
    assert_invariants(&sup);

    // Shut down cleanly.
    sup.enter_runlevel(0);
    settle(&mut sup, |sup| pid_of(sup, "serv") == 0);
    assert_eq!(state_of(&sup, "serv"), SvcState::Halted);
    assert!(!common::is_process_alive(pid));
    assert_invariants(&sup);
}

#[test]
fn pidfile_readiness_gates_running() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    let pidfile = runtime::run_dir().join("serv.pid");
    fs::create_dir_all(runtime::run_dir()).unwrap();
    let script = format!(
        "sleep 0.3 && echo $$ > {} && exec sleep 60",
        pidfile.display()
    );
    write_conf(&format!(
        "runlevel 2\n\
         service [2] name:serv /bin/sh -c \"{script}\" -P {}\n",
        pidfile.display()
    ));

    let mut sup = common::boot();
    assert_eq!(
        state_of(&sup, "serv"),
        SvcState::Starting,
        "no readiness before the pidfile appears"
    );
    assert_eq!(sup.conds.get("service/serv/ready"), CondState::Off);

    settle(&mut sup, |sup| state_of(sup, "serv") == SvcState::Running);
    assert_eq!(sup.conds.get("service/serv/ready"), CondState::On);

    let recorded: i32 = fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(pid_of(&sup, "serv"), recorded, "pid tracks the pidfile");
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| pid_of(sup, "serv") == 0);
}

#[test]
fn crash_loop_blocks_and_client_start_releases() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\nservice [234] name:flappy /bin/sh -c 'exit 1'\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| state_of(sup, "flappy") == SvcState::Blocked);

    // No further forks while blocked.
    let before = sup.registry.find("flappy", "").unwrap().restarts;
    sup.step_all();
    sup.step_all();
    assert_eq!(state_of(&sup, "flappy"), SvcState::Blocked);
    assert_eq!(pid_of(&sup, "flappy"), 0);
    assert_eq!(sup.registry.find("flappy", "").unwrap().restarts, before);

    // `initctl start flappy` releases the block (and the loop resumes).
    let failed = sup.apply_job_action(Cmd::StartSvc, "flappy");
    assert_eq!(failed, 0);
    assert_ne!(state_of(&sup, "flappy"), SvcState::Blocked);
    assert_eq!(sup.registry.find("flappy", "").unwrap().restarts, 0);

    // Park it so the crash loop stops churning.
    sup.apply_job_action(Cmd::StopSvc, "flappy");
    settle(&mut sup, |sup| pid_of(sup, "flappy") == 0);
}

#[test]
fn oneshot_task_runs_once_and_reruns_on_condition_edge() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    let marker = temp.path().join("ran");
    write_conf(&format!(
        "runlevel 2\n\
         task [2] <usr/fire> name:once /bin/sh -c 'echo x >> {}'\n",
        marker.display()
    ));

    let mut sup = common::boot();
    assert_eq!(state_of(&sup, "once"), SvcState::Waiting);

    sup.cond_set("usr/fire");
    settle(&mut sup, |sup| state_of(sup, "once") == SvcState::Done);
    assert_eq!(fs::read_to_string(&marker).unwrap().lines().count(), 1);

    // Still done while the condition holds.
    sup.step_all();
    assert_eq!(state_of(&sup, "once"), SvcState::Done);

    // A fresh rising edge re-triggers the task.
    sup.cond_clear("usr/fire");
    sup.cond_set("usr/fire");
    settle(&mut sup, |sup| {
        state_of(sup, "once") == SvcState::Done
            && fs::read_to_string(&marker).unwrap().lines().count() == 2
    });
    assert_invariants(&sup);
}

#[test]
fn run_declarations_block_the_boot_sequence() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    let marker = temp.path().join("boot-step");
    write_conf(&format!(
        "runlevel 2\n\
         run [2] name:setup /bin/sh -c 'sleep 0.2 && echo ok > {}'\n",
        marker.display()
    ));

    let sup = common::boot();
    // bootstrap() has already waited for the run task.
    assert_eq!(state_of(&sup, "setup"), SvcState::Done);
    assert_eq!(fs::read_to_string(&marker).unwrap().trim(), "ok");
    assert_invariants(&sup);
}

#[test]
fn stop_escalates_to_sigkill_after_grace() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    // The child ignores SIGTERM; only SIGKILL can end it.
    write_conf(
        "runlevel 2\n\
         service [2] name:stubborn /bin/sh -c 'trap \"\" TERM; sleep 60 & wait'\n",
    );

    let mut sup = common::boot();
    sup.conf.stop_grace = std::time::Duration::from_millis(200);
    settle(&mut sup, |sup| state_of(sup, "stubborn") == SvcState::Running);
    let pid = pid_of(&sup, "stubborn");

    sup.apply_job_action(Cmd::StopSvc, "stubborn");
    assert_eq!(state_of(&sup, "stubborn"), SvcState::Stopping);
    assert!(common::is_process_alive(pid), "SIGTERM is trapped");

    settle(&mut sup, |sup| state_of(sup, "stubborn") == SvcState::Halted);
    assert!(!common::is_process_alive(pid));
}
