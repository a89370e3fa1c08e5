#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, assert_invariants, pid_of, settle, state_of, write_conf};
use rinit::{cond::CondState, svc::SvcState};
use tempfile::tempdir;

#[test]
fn readiness_chains_gate_dependent_services() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 2\n\
         service [234] name:db /bin/sh -c 'exec sleep 60'\n\
         service [234] <service/db/ready> name:web /bin/sh -c 'exec sleep 60'\n",
    );

    let mut sup = common::boot();
    settle(&mut sup, |sup| {
        state_of(sup, "db") == SvcState::Running
            && state_of(sup, "web") == SvcState::Running
    });
    assert_invariants(&sup);

    // Stopping the producer pulls the dependent down with it.
    sup.apply_job_action(rinit::api::Cmd::StopSvc, "db");
    settle(&mut sup, |sup| {
        state_of(sup, "db") == SvcState::Halted
            && pid_of(sup, "web") == 0
    });
    assert_eq!(sup.conds.get("service/db/ready"), CondState::Off);
    assert_eq!(state_of(&sup, "web"), SvcState::Waiting);

    // Starting it again brings the dependent back.
    sup.apply_job_action(rinit::api::Cmd::StartSvc, "db");
    settle(&mut sup, |sup| {
        state_of(sup, "db") == SvcState::Running
            && state_of(sup, "web") == SvcState::Running
    });
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn emit_set_then_clear_round_trips_service_states() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf(
        "runlevel 2\n\
         service [234] <usr/net> name:gated /bin/sh -c 'exec sleep 60'\n\
         service [234] name:free /bin/sh -c 'exec sleep 60'\n",
    );

    let mut sup = common::boot();
    settle(&mut sup, |sup| state_of(sup, "free") == SvcState::Running);
    assert_eq!(state_of(&sup, "gated"), SvcState::Waiting);
    let free_pid = pid_of(&sup, "free");

    // set(k) then clear(k): every service ends where it began.
    sup.cond_set("usr/net");
    settle(&mut sup, |sup| state_of(sup, "gated") == SvcState::Running);

    sup.cond_clear("usr/net");
    settle(&mut sup, |sup| pid_of(sup, "gated") == 0);
    sup.step_all();

    assert_eq!(state_of(&sup, "gated"), SvcState::Waiting);
    assert_eq!(state_of(&sup, "free"), SvcState::Running);
    assert_eq!(pid_of(&sup, "free"), free_pid);
    assert_invariants(&sup);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn condition_files_mirror_assertions() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\nservice [234] name:svc /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| state_of(sup, "svc") == SvcState::Running);

    let path = rinit::runtime::cond_dir().join("service/svc/ready");
    assert!(path.exists(), "asserted condition has an on-disk file");

    sup.apply_job_action(rinit::api::Cmd::StopSvc, "svc");
    settle(&mut sup, |sup| state_of(sup, "svc") == SvcState::Halted);
    assert!(!path.exists(), "cleared condition file removed");
}

#[test]
fn unknown_condition_keys_read_off() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());

    write_conf("runlevel 2\n");
    let sup = common::boot();
    assert_eq!(sup.conds.get("never/was"), CondState::Off);
}
