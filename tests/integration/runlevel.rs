#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, assert_invariants, pid_of, settle, state_of, write_conf};
use rinit::svc::SvcState;
use tempfile::tempdir;

#[test]
fn runlevel_down_stops_only_the_leaving_set() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 2\n\
         service [2345] name:a /bin/sh -c 'exec sleep 60'\n\
         service [2] name:b /bin/sh -c 'exec sleep 60'\n",
    );

    let mut sup = common::boot();
    settle(&mut sup, |sup| {
        state_of(sup, "a") == SvcState::Running && state_of(sup, "b") == SvcState::Running
    });
    let a_pid = pid_of(&sup, "a");
    let b_pid = pid_of(&sup, "b");

    sup.enter_runlevel(3);
    assert_eq!(sup.sched.runlevel, 3);
    assert_eq!(sup.sched.prevlevel, 2);

    settle(&mut sup, |sup| state_of(sup, "b") == SvcState::Halted);
    assert!(!common::is_process_alive(b_pid));
    assert_eq!(state_of(&sup, "a"), SvcState::Running);
    assert_eq!(pid_of(&sup, "a"), a_pid, "A keeps its pid across the change");
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn runlevel_up_starts_the_entering_set() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 2\n\
         service [3] name:later /bin/sh -c 'exec sleep 60'\n",
    );

    let mut sup = common::boot();
    assert_eq!(state_of(&sup, "later"), SvcState::Halted);

    sup.enter_runlevel(3);
    settle(&mut sup, |sup| state_of(sup, "later") == SvcState::Running);
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn single_user_boot_enters_runlevel_one() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 4\n\
         service [S] name:one /bin/sh -c 'exec sleep 60'\n\
         service [4] name:multi /bin/sh -c 'exec sleep 60'\n",
    );

    let mut sup = common::boot_with(rinit::supervisor::Options {
        single: true,
        ..Default::default()
    });
    assert_eq!(sup.sched.runlevel, 1, "single-user overrides runlevel");

    settle(&mut sup, |sup| state_of(sup, "one") == SvcState::Running);
    assert_eq!(state_of(&sup, "multi"), SvcState::Halted);
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn halt_reaches_all_services_halted() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 2\n\
         service [234] name:a /bin/sh -c 'exec sleep 60'\n\
         service [234] name:b /bin/sh -c 'exec sleep 60'\n\
         task [234] name:t /bin/true\n",
    );

    let mut sup = common::boot();
    settle(&mut sup, |sup| {
        state_of(sup, "a") == SvcState::Running && state_of(sup, "b") == SvcState::Running
    });

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
    for svc in sup.registry.iter() {
        assert_eq!(svc.state, SvcState::Halted, "{} not halted", svc.spec.name);
    }
}
