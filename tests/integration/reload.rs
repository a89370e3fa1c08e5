#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, assert_invariants, pid_of, settle, state_of, write_conf, write_rcsd};
use rinit::svc::SvcState;
use std::fs;
use tempfile::tempdir;

#[test]
fn mark_and_sweep_removes_adds_and_preserves() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\n");
    write_rcsd("a.conf", "service [234] name:a /bin/sh -c 'exec sleep 60'\n");
    let b_path = write_rcsd("b.conf", "service [234] name:b /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| {
        state_of(sup, "a") == SvcState::Running && state_of(sup, "b") == SvcState::Running
    });
    let a_pid = pid_of(&sup, "a");

    // Remove B's file, add C, reload.
    fs::remove_file(&b_path).unwrap();
    write_rcsd("c.conf", "service [234] name:c /bin/sh -c 'exec sleep 60'\n");
    sup.reload();

    // B leaves via STOPPING and disappears from iteration.
    settle(&mut sup, |sup| sup.registry.find("b", "").is_none());
    // C comes up, A is untouched.
    settle(&mut sup, |sup| state_of(sup, "c") == SvcState::Running);
    assert_eq!(pid_of(&sup, "a"), a_pid, "unchanged service keeps its pid");
    assert_eq!(state_of(&sup, "a"), SvcState::Running);
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn changed_declaration_restarts_the_service() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\n");
    write_rcsd("a.conf", "service [234] name:a /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| state_of(sup, "a") == SvcState::Running);
    let old_pid = pid_of(&sup, "a");

    write_rcsd("a.conf", "service [234] name:a /bin/sh -c 'exec sleep 61'\n");
    sup.reload();

    settle(&mut sup, |sup| {
        let svc = sup.registry.find("a", "").unwrap();
        svc.state == SvcState::Running && svc.pid != old_pid
    });
    assert!(!common::is_process_alive(old_pid));
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn unchanged_reload_is_identity() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\n");
    write_rcsd("a.conf", "service [234] name:a /bin/sh -c 'exec sleep 60'\n");
    write_rcsd("t.conf", "task [234] name:t /bin/true\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| {
        state_of(sup, "a") == SvcState::Running && state_of(sup, "t") == SvcState::Done
    });
    let a_pid = pid_of(&sup, "a");

    sup.reload();

    // Reload of an unchanged set: nothing dirty, nothing restarted and a
    // further step_all is a no-op.
    for svc in sup.registry.iter() {
        assert!(!svc.dirty, "{} dirty after no-op reload", svc.spec.name);
    }
    assert_eq!(pid_of(&sup, "a"), a_pid);
    assert_eq!(state_of(&sup, "a"), SvcState::Running);
    let transitions = sup.sched.step_all(
        &mut sup.registry,
        &mut sup.conds,
        &sup.conf,
        &sup.cgroups,
        rinit::sched::KIND_ALL,
    );
    assert_eq!(transitions, 0, "step_all must be a no-op after reload");
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn dirty_propagates_to_dependents_on_reload() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\n");
    write_rcsd("b.conf", "service [234] name:b /bin/sh -c 'exec sleep 60'\n");
    write_rcsd(
        "a.conf",
        "service [234] <service/b/ready> name:a /bin/sh -c 'exec sleep 60'\n",
    );

    let mut sup = common::boot();
    settle(&mut sup, |sup| {
        state_of(sup, "a") == SvcState::Running && state_of(sup, "b") == SvcState::Running
    });
    let a_pid = pid_of(&sup, "a");

    // Changing B must cycle A too (A's condition atom names B).
    write_rcsd("b.conf", "service [234] name:b /bin/sh -c 'exec sleep 61'\n");
    sup.reload();

    settle(&mut sup, |sup| {
        let a = sup.registry.find("a", "").unwrap();
        let b = sup.registry.find("b", "").unwrap();
        a.state == SvcState::Running
            && b.state == SvcState::Running
            && a.pid != a_pid
    });
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn protected_service_survives_file_removal() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\n");
    let mut sup = common::boot();

    // A plugin-style registration: no source file, protected.
    sup.registry.register(rinit::svc::SvcSpec {
        kind: rinit::svc::SvcKind::Service,
        name: "wdog".to_string(),
        id: String::new(),
        runlevels: 0b0001_1100,
        cond: Vec::new(),
        sighup: true,
        cmd: "/bin/sh".into(),
        args: vec!["-c".to_string(), "exec sleep 60".to_string()],
        workdir: None,
        user: None,
        group: None,
        rlimits: Vec::new(),
        cgroup: String::new(),
        pidfile: None,
        log: rinit::svc::LogPolicy::Null,
        descr: "Watchdog".to_string(),
        file: None,
        protected: true,
    });
    sup.step_all();
    settle(&mut sup, |sup| state_of(sup, "wdog") == SvcState::Running);
    let pid = pid_of(&sup, "wdog");

    sup.reload();
    assert!(sup.registry.find("wdog", "").is_some());
    assert_eq!(pid_of(&sup, "wdog"), pid);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}
