#[path = "common/mod.rs"]
mod common;

use common::{HomeEnvGuard, settle, state_of, write_conf};
use rinit::{
    api::{Cmd, Request},
    constants::REQUEST_LEN,
    event::{Event, Source},
    runtime,
    supervisor::Supervisor,
    svc::SvcState,
};
use std::{
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
};
use tempfile::tempdir;

/// Connects a client and lets the supervisor accept it as slot 0, 1, ...
fn connect(sup: &mut Supervisor) -> UnixStream {
    let client = UnixStream::connect(runtime::api_socket()).expect("connect");
    sup.handle_event(Event::Readable(Source::Api));
    client
}

/// One request/reply exchange on an accepted connection.
fn roundtrip(
    sup: &mut Supervisor,
    client: &mut UnixStream,
    slot: usize,
    request: &Request,
) -> Request {
    client.write_all(&request.to_bytes()).expect("send");
    sup.handle_event(Event::Readable(Source::ApiConn(slot)));

    let mut buf = [0u8; REQUEST_LEN];
    client.read_exact(&mut buf).expect("reply");
    Request::from_bytes(&buf).expect("reply record")
}

/// One SVC_ITER/SVC_FIND exchange; the reply is a serialised record line.
fn record_line(
    sup: &mut Supervisor,
    reader: &mut BufReader<UnixStream>,
    slot: usize,
    request: &Request,
) -> String {
    reader
        .get_mut()
        .write_all(&request.to_bytes())
        .expect("send");
    sup.handle_event(Event::Readable(Source::ApiConn(slot)));

    let mut line = String::new();
    reader.read_line(&mut line).expect("record");
    line
}

#[test]
fn svc_query_reports_unmatched_selectors() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\nservice [9] name:svc1 /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    let mut client = connect(&mut sup);

    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::SvcQuery, "svc1,bogus:9"),
    );
    assert_eq!(reply.cmd, Cmd::Nack as u32);
    assert_eq!(reply.data_str(), "bogus:9 ");

    // All selectors resolving yields an ACK and no payload.
    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::SvcQuery, "svc1"),
    );
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    assert_eq!(reply.data_str(), "");
}

#[test]
fn runlvl_and_get_runlevel() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\n");

    let mut sup = common::boot();
    let mut client = connect(&mut sup);

    let mut request = Request::new(Cmd::Runlvl);
    request.runlevel = '3' as i32;
    let reply = roundtrip(&mut sup, &mut client, 0, &request);
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    assert_eq!(sup.sched.runlevel, 3);

    let reply = roundtrip(&mut sup, &mut client, 0, &Request::new(Cmd::GetRunlevel));
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    assert_eq!(reply.runlevel, 3);
    assert_eq!(reply.sleeptime, 2, "previous runlevel is latched");

    // 's' maps to single user.
    let mut request = Request::new(Cmd::Runlvl);
    request.runlevel = 's' as i32;
    roundtrip(&mut sup, &mut client, 0, &request);
    assert_eq!(sup.sched.runlevel, 1);

    // Garbage runlevels are refused.
    let mut request = Request::new(Cmd::Runlvl);
    request.runlevel = 'x' as i32;
    let reply = roundtrip(&mut sup, &mut client, 0, &request);
    assert_eq!(reply.cmd, Cmd::Nack as u32);
}

#[test]
fn start_stop_restart_via_socket() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\nservice [234] name:svc /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| state_of(sup, "svc") == SvcState::Running);
    let mut client = connect(&mut sup);

    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::StopSvc, "svc"),
    );
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    settle(&mut sup, |sup| state_of(sup, "svc") == SvcState::Halted);

    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::StartSvc, "svc"),
    );
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    settle(&mut sup, |sup| state_of(sup, "svc") == SvcState::Running);

    // Unknown selectors NACK.
    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::StartSvc, "nosuch"),
    );
    assert_eq!(reply.cmd, Cmd::Nack as u32);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn svc_iter_visits_each_service_once_per_pass() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf(
        "runlevel 2\n\
         service [9] name:alpha /bin/true\n\
         service [9] name:beta /bin/true\n",
    );

    let mut sup = common::boot();
    let client = connect(&mut sup);
    let mut reader = BufReader::new(client);

    let mut first = Request::new(Cmd::SvcIter);
    first.runlevel = 1; /* restart iteration */
    let next = Request::new(Cmd::SvcIter);

    let mut names = Vec::new();
    let mut line = record_line(&mut sup, &mut reader, 0, &first);
    while !line.contains("\"pid\":-1") {
        for name in ["alpha", "beta"] {
            if line.contains(&format!("\"name\":\"{name}\"")) {
                names.push(name);
            }
        }
        line = record_line(&mut sup, &mut reader, 0, &next);
    }
    assert_eq!(names, vec!["alpha", "beta"], "each service exactly once");

    // Exhausted cursor keeps returning the terminal record.
    let line = record_line(&mut sup, &mut reader, 0, &next);
    assert!(line.contains("\"pid\":-1"));

    // Restart flag rewinds this connection's cursor.
    let line = record_line(&mut sup, &mut reader, 0, &first);
    assert!(line.contains("\"name\":\"alpha\""));
}

#[test]
fn svc_iter_cursors_are_per_connection() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf(
        "runlevel 2\n\
         service [9] name:alpha /bin/true\n\
         service [9] name:beta /bin/true\n",
    );

    let mut sup = common::boot();
    let one = connect(&mut sup);
    let two = connect(&mut sup);
    let mut one = BufReader::new(one);
    let mut two = BufReader::new(two);

    let mut first = Request::new(Cmd::SvcIter);
    first.runlevel = 1;
    let next = Request::new(Cmd::SvcIter);

    let line = record_line(&mut sup, &mut one, 0, &first);
    assert!(line.contains("\"name\":\"alpha\""));
    let line = record_line(&mut sup, &mut one, 0, &next);
    assert!(line.contains("\"name\":\"beta\""));

    // The second client starts from the top regardless of the first.
    let line = record_line(&mut sup, &mut two, 1, &first);
    assert!(line.contains("\"name\":\"alpha\""));
}

#[test]
fn svc_find_returns_record_or_sentinel() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\nservice [9] name:svc :2 /bin/true\n");

    let mut sup = common::boot();
    let client = connect(&mut sup);
    let mut reader = BufReader::new(client);

    let line = record_line(
        &mut sup,
        &mut reader,
        0,
        &Request::with_data(Cmd::SvcFind, "svc:2"),
    );
    assert!(line.contains("\"name\":\"svc\""));
    assert!(line.contains("\"id\":\"2\""));

    let line = record_line(
        &mut sup,
        &mut reader,
        0,
        &Request::with_data(Cmd::SvcFind, "ghost"),
    );
    assert!(line.contains("\"pid\":-1"), "sentinel for missing services");
}

#[test]
fn emit_sets_and_clears_conditions() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\nservice [234] <usr/net> name:gated /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    let mut client = connect(&mut sup);
    assert_eq!(state_of(&sup, "gated"), SvcState::Waiting);

    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::Emit, "+usr/net"),
    );
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    settle(&mut sup, |sup| state_of(sup, "gated") == SvcState::Running);

    roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::Emit, "-usr/net"),
    );
    settle(&mut sup, |sup| state_of(sup, "gated") == SvcState::Waiting);

    // Bare tokens assert, and RELOAD is a reserved word (still ACKed).
    let reply = roundtrip(
        &mut sup,
        &mut client,
        0,
        &Request::with_data(Cmd::Emit, "usr/other RELOAD"),
    );
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    assert_eq!(sup.conds.get("usr/other"), rinit::cond::CondState::On);
}

#[test]
fn wdog_hello_hands_over_watchdog_role() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\nservice [234] name:wdog /bin/sh -c 'exec sleep 60'\n");

    let mut sup = common::boot();
    settle(&mut sup, |sup| state_of(sup, "wdog") == SvcState::Running);
    let pid = common::pid_of(&sup, "wdog");
    let mut client = connect(&mut sup);

    let mut request = Request::new(Cmd::WdogHello);
    request.runlevel = pid;
    let reply = roundtrip(&mut sup, &mut client, 0, &request);
    assert_eq!(reply.cmd, Cmd::Ack as u32);
    assert!(sup.registry.find("wdog", "").unwrap().spec.protected);

    // A non-positive pid is refused.
    let mut request = Request::new(Cmd::WdogHello);
    request.runlevel = 0;
    let reply = roundtrip(&mut sup, &mut client, 0, &request);
    assert_eq!(reply.cmd, Cmd::Nack as u32);

    sup.enter_runlevel(0);
    settle(&mut sup, |sup| sup.registry.iter().all(|svc| svc.pid == 0));
}

#[test]
fn bad_magic_drops_the_connection() {
    let temp = tempdir().unwrap();
    let _home = HomeEnvGuard::set(temp.path());
    write_conf("runlevel 2\n");

    let mut sup = common::boot();
    let mut client = connect(&mut sup);

    let mut bytes = Request::new(Cmd::Reload).to_bytes();
    bytes[0..4].copy_from_slice(&0xbad0_badu32.to_le_bytes());
    client.write_all(&bytes).unwrap();
    sup.handle_event(Event::Readable(Source::ApiConn(0)));

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0, "server closed the stream");
}
