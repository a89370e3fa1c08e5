//! The supervisor: owns every table and wires events to the scheduler.
//!
//! A single privileged process that must never crash: unexpected errors are
//! logged and downgraded, only explicit shutdown (signal or client RUNLVL
//! 0/6) leaves the run loop.

use std::{fs, io::Write, time::Duration};

use fs2::FileExt;
use tracing::{debug, error, info, warn};

use crate::{
    api::{ApiServer, Cmd, ReadOutcome, Request},
    cgroup::CgroupTable,
    cond::CondStore,
    conf::{Conf, ConfWatcher, Loader},
    constants::DEFAULT_SERVICE_INTERVAL,
    error::SupervisorError,
    event::{Event, EventLoop, Source, Timer},
    plugin::{Dispatcher, Hook, PluginCtx},
    runtime,
    sched::{KIND_ALL, Sched},
    sig::{self, SigEvent, SignalPipe},
    spawn,
    svc::{Selector, SvcKind, SvcRecord, SvcSpec, parse_jobstr},
};

/// What to do with the machine once everything is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltAction {
    /// Halt the system.
    Halt,
    /// Power it off.
    Poweroff,
    /// Reboot.
    Reboot,
}

/// Start-up options resolved from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Enter rescue mode: ignore configuration, offer a root shell.
    pub rescue: bool,
    /// Enter single-user mode (runlevel 1) after bootstrap.
    pub single: bool,
    /// Runlevel override from the command line.
    pub runlevel: Option<u8>,
    /// Reload automatically when watched configuration files change.
    pub autoreload: bool,
}

/// The process-1 service supervisor.
pub struct Supervisor {
    pub conf: Conf,
    pub registry: crate::svc::Registry,
    pub conds: CondStore,
    pub cgroups: CgroupTable,
    pub sched: Sched,
    dispatcher: Dispatcher,
    watcher: Option<ConfWatcher>,
    api: ApiServer,
    eloop: EventLoop,
    _signals: Option<SignalPipe>,
    options: Options,
    /// Watchdog service identity after a WDOG_HELLO hand-over.
    wdog: Option<(String, String)>,
    halt: Option<HaltAction>,
    _pidfile: Option<fs::File>,
}

impl Supervisor {
    /// Sets up state directories, the API socket and the signal pipe.
    pub fn new(options: Options) -> Result<Self, SupervisorError> {
        let state_dir = runtime::state_dir();
        fs::create_dir_all(&state_dir)?;

        let pidfile = Self::claim_pidfile()?;
        let conds = CondStore::new(runtime::cond_dir())?;
        let api = ApiServer::bind(runtime::api_socket())?;
        let signals = sig::install()?;

        let mut eloop = EventLoop::new();
        eloop.register(Source::Signal, signals.fd());
        eloop.register(Source::Api, api.fd());

        Ok(Supervisor {
            conf: Conf::default(),
            registry: crate::svc::Registry::new(),
            conds,
            cgroups: CgroupTable::default(),
            sched: Sched::new(),
            dispatcher: Dispatcher::with_builtins(),
            watcher: None,
            api,
            eloop,
            _signals: Some(signals),
            options,
            wdog: None,
            halt: None,
            _pidfile: Some(pidfile),
        })
    }

    /// Test constructor: no signal handlers, no pidfile lock.
    #[doc(hidden)]
    pub fn new_for_test(options: Options) -> Result<Self, SupervisorError> {
        fs::create_dir_all(runtime::state_dir())?;
        let conds = CondStore::new(runtime::cond_dir())?;
        let api = ApiServer::bind(runtime::api_socket())?;

        Ok(Supervisor {
            conf: Conf::default(),
            registry: crate::svc::Registry::new(),
            conds,
            cgroups: CgroupTable::default(),
            sched: Sched::new(),
            dispatcher: Dispatcher::with_builtins(),
            watcher: None,
            api,
            eloop: EventLoop::new(),
            _signals: None,
            options,
            wdog: None,
            halt: None,
            _pidfile: None,
        })
    }

    fn claim_pidfile() -> Result<fs::File, SupervisorError> {
        let path = runtime::supervisor_pidfile();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            SupervisorError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "another supervisor holds the pidfile lock",
            ))
        })?;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(file)
    }

    /// Brings the system up: hooks, configuration, helpers, first runlevel.
    pub fn bootstrap(&mut self) -> Result<(), SupervisorError> {
        self.run_hook(Hook::Banner);
        self.run_hook(Hook::RootfsUp);
        self.run_hook(Hook::BasefsUp);

        self.conf.rescue = self.options.rescue;
        self.conf.single = self.options.single;

        if self.conf.rescue {
            info!("Entering rescue mode");
            self.register_rescue_shell();
        } else {
            let mut loader = Loader::new(
                &mut self.conf,
                &mut self.registry,
                &mut self.cgroups,
                true,
            );
            if let Err(err) = loader.load() {
                error!("Configuration load failed: {err}");
            }
        }

        self.apply_hostname();
        spawn::apply_rlimits(&self.conf.rlimits);
        self.cgroups.config();

        // Bootstrap helpers; blocking is permitted here, never later.
        for module in self.conf.modules.clone() {
            let _ = spawn::run(&format!("modprobe {module}"));
        }
        for node in self.conf.mknod.clone() {
            let _ = spawn::run(&format!("mknod {node}"));
        }
        if let Some(network) = self.conf.network.clone() {
            if let Err(err) = spawn::run(&network) {
                warn!("Network helper failed: {err}");
            }
        }
        self.run_hook(Hook::NetworkUp);
        if let Some(runparts) = self.conf.runparts.clone() {
            if let Err(err) = spawn::run(&runparts) {
                warn!("runparts helper failed: {err}");
            }
        }

        if self.options.autoreload {
            match ConfWatcher::new() {
                Ok(watcher) => {
                    self.eloop.register(Source::ConfWatch, watcher.fd());
                    self.watcher = Some(watcher);
                }
                Err(err) => warn!("Config watcher unavailable: {err}"),
            }
        }
        self.register_plugin_fds();
        self.apply_service_interval();

        let level = if self.conf.rescue || self.conf.single || self.options.single {
            1
        } else {
            self.options.runlevel.unwrap_or(self.conf.runlevel)
        };
        self.enter_runlevel(level);
        self.await_run_tasks();
        self.run_hook(Hook::SvcUp);
        self.run_hook(Hook::SystemUp);
        info!("System up, runlevel {}", self.sched.runlevel);
        Ok(())
    }

    /// `run` one-shots gate the boot sequence: wait for each in turn. The
    /// only place blocking waits are allowed.
    fn await_run_tasks(&mut self) {
        loop {
            let pending = self
                .registry
                .iter()
                .find(|svc| {
                    svc.spec.kind == SvcKind::Run
                        && svc.state == crate::svc::SvcState::Starting
                        && svc.pid > 0
                })
                .map(|svc| svc.pid);
            let Some(pid) = pending else { return };

            self.sched
                .wait_pid_blocking(&mut self.registry, &mut self.conds, pid);
            self.step_all();
        }
    }

    /// Rescue fallback: a respawning root shell eligible everywhere.
    fn register_rescue_shell(&mut self) {
        self.registry.register(SvcSpec {
            kind: SvcKind::Tty,
            name: "rescue".to_string(),
            id: String::new(),
            runlevels: crate::conf::parse_runlevels(Some("[12345]")),
            cond: Vec::new(),
            sighup: false,
            cmd: "/bin/sh".into(),
            args: Vec::new(),
            workdir: None,
            user: None,
            group: None,
            rlimits: Vec::new(),
            cgroup: String::new(),
            pidfile: None,
            log: crate::svc::LogPolicy::Console,
            descr: "Rescue shell".to_string(),
            file: None,
            protected: true,
        });
    }

    fn apply_hostname(&self) {
        let Some(hostname) = self.conf.hostname.as_deref() else {
            return;
        };
        if runtime::mode() != runtime::RuntimeMode::System {
            debug!("Would set hostname {hostname}");
            return;
        }
        if let Err(errno) = nix::unistd::sethostname(hostname) {
            warn!("Failed setting hostname {hostname}: {errno}");
        }
    }

    fn register_plugin_fds(&mut self) {
        for (index, fd) in self.dispatcher.io_sources() {
            self.eloop.register(Source::Plugin(index), fd);
        }
    }

    /// Arms the periodic instability-decay tick. A configured interval of 0
    /// re-arms a previously disabled tick at the default period.
    fn apply_service_interval(&mut self) {
        let period = match self.conf.service_interval {
            0 => {
                if self.eloop.timer_armed(Timer::Tick) {
                    return;
                }
                DEFAULT_SERVICE_INTERVAL
            }
            secs => Duration::from_secs(secs),
        };
        self.eloop.set_timer(Timer::Tick, period, Some(period));
    }

    fn run_hook(&mut self, hook: Hook) {
        let mut ctx = PluginCtx {
            registry: &mut self.registry,
            conds: &mut self.conds,
            conf: &self.conf,
        };
        self.dispatcher.run_hook(hook, &mut ctx);
    }

    /// Steps everything to a fixed point and rearms the SIGKILL timer.
    pub fn step_all(&mut self) {
        self.sched.step_all(
            &mut self.registry,
            &mut self.conds,
            &self.conf,
            &self.cgroups,
            KIND_ALL,
        );
        self.registry.purge_removed();
        self.arm_kill_timer();
    }

    fn arm_kill_timer(&mut self) {
        match self.sched.next_kill_deadline() {
            Some(deadline) => {
                let after = deadline.saturating_duration_since(std::time::Instant::now());
                self.eloop.set_timer(Timer::Kill, after, None);
            }
            None => self.eloop.cancel_timer(Timer::Kill),
        }
    }

    /// Asserts a condition and re-evaluates affected services.
    pub fn cond_set(&mut self, key: &str) {
        if self.conds.set(key) {
            self.mark_cond_dirty(key);
            self.step_all();
        }
    }

    /// Deasserts a condition and re-evaluates affected services.
    pub fn cond_clear(&mut self, key: &str) {
        if self.conds.clear(key) {
            self.mark_cond_dirty(key);
            self.step_all();
        }
    }

    fn mark_cond_dirty(&mut self, key: &str) {
        for svc in self.registry.iter_mut() {
            if svc.references(key) {
                svc.dirty = true;
            }
        }
    }

    /// Reaps exited children, applies transitions and converges.
    pub fn reap_and_step(&mut self) {
        if self.sched.reap(&mut self.registry, &mut self.conds) {
            self.step_all();
        }
    }

    /// Mark-and-sweep configuration reload.
    pub fn reload(&mut self) {
        info!("Reloading configuration");

        // Affected conditions must not read OFF while producers re-settle.
        self.conds.flux_all("service/");

        self.registry.mark_dynamic();
        self.cgroups.mark_all();
        self.conf.reset_for_reload();

        let mut loader = Loader::new(
            &mut self.conf,
            &mut self.registry,
            &mut self.cgroups,
            false,
        );
        if let Err(err) = loader.load() {
            error!("Configuration reload failed: {err}");
        }

        self.registry.sweep();
        spawn::apply_rlimits(&self.conf.rlimits);
        self.cgroups.config();
        self.cgroups.cleanup();
        self.registry.propagate_dirty();

        // Unchanged running services reassert their readiness before anyone
        // is stepped; only genuinely affected conditions settle to OFF.
        self.run_hook(Hook::SvcReconf);
        self.conds.settle();

        self.step_all();
        if let Some(watcher) = &mut self.watcher {
            watcher.drop_changes();
        }
        self.apply_service_interval();
    }

    /// Two-phase runlevel change; 0 and 6 latch the halt intent.
    pub fn enter_runlevel(&mut self, level: u8) {
        if level == 0 && self.halt.is_none() {
            self.halt = Some(HaltAction::Poweroff);
        }
        if level == 6 {
            self.halt = Some(HaltAction::Reboot);
        }
        self.sched.enter_runlevel(
            &mut self.registry,
            &mut self.conds,
            &self.conf,
            &self.cgroups,
            level,
        );
        self.registry.purge_removed();
        self.arm_kill_timer();
    }

    fn begin_shutdown(&mut self, action: HaltAction) {
        if self.halt.is_none() {
            self.halt = Some(action);
        }
        let level = if action == HaltAction::Reboot { 6 } else { 0 };
        self.enter_runlevel(level);
    }

    /// True once a shutdown was requested and every child has been reaped.
    fn shutdown_complete(&self) -> bool {
        self.halt.is_some() && self.registry.iter().all(|svc| svc.pid == 0)
    }

    /// Runs the event loop until an explicit shutdown completes.
    pub fn run(&mut self) -> Result<HaltAction, SupervisorError> {
        while !self.shutdown_complete() {
            let events = match self.eloop.wait() {
                Ok(events) => events,
                Err(err) => {
                    // The supervisor never exits on unexpected errors.
                    error!("Event loop error: {err}");
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };
            for event in events {
                self.handle_event(event);
            }
        }

        let action = self.halt.unwrap_or(HaltAction::Halt);
        self.finalize(action);
        Ok(action)
    }

    fn finalize(&mut self, action: HaltAction) {
        info!("Shutting down: {action:?}");
        self.run_hook(Hook::SvcDown);
        self.run_hook(Hook::NetworkDown);

        if let Some(helper) = self.conf.shutdown.clone() {
            if let Err(err) = spawn::run(&helper) {
                warn!("Shutdown helper failed: {err}");
            }
        }

        self.run_hook(Hook::BasefsDown);
        self.run_hook(Hook::RootfsDown);

        let _ = fs::remove_file(runtime::api_socket());
        let _ = fs::remove_file(runtime::supervisor_pidfile());
    }

    /// Dispatches one loop event.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Signal(signal) => {
                if let Some(sig_event) = sig::event_for(signal) {
                    self.handle_signal(sig_event);
                }
            }
            Event::Readable(Source::Api) => {
                while let Some(slot) = self.api.accept() {
                    if let Some(fd) = self.api.conn_fd(slot) {
                        self.eloop.register(Source::ApiConn(slot), fd);
                    }
                }
            }
            Event::Readable(Source::ApiConn(slot)) => match self.api.read_request(slot) {
                ReadOutcome::Request(request) => self.handle_request(slot, request),
                ReadOutcome::Again => {}
                ReadOutcome::Closed => self.eloop.unregister(Source::ApiConn(slot)),
            },
            Event::Readable(Source::ConfWatch) => {
                let any = match &mut self.watcher {
                    Some(watcher) => {
                        watcher.handle_events();
                        watcher.any_change()
                    }
                    None => false,
                };
                if any {
                    self.reload();
                }
            }
            Event::Readable(Source::Plugin(index)) => {
                let mut ctx = PluginCtx {
                    registry: &mut self.registry,
                    conds: &mut self.conds,
                    conf: &self.conf,
                };
                self.dispatcher.io_ready(index, &mut ctx);
                self.step_all();
            }
            Event::Readable(Source::Signal) => {}
            Event::Tick(Timer::Tick) => self.sched.tick(&mut self.registry),
            Event::Tick(Timer::Kill) => {
                self.sched.escalate_kills();
                self.arm_kill_timer();
            }
            Event::Closed(Source::Api) => {
                warn!("API socket error, re-initialising");
                self.eloop.unregister(Source::Api);
                match self.api.rebind() {
                    Ok(()) => self.eloop.register(Source::Api, self.api.fd()),
                    Err(err) => {
                        // Fatal for the API, not for the supervisor.
                        error!("Unrecoverable error on API socket: {err}");
                    }
                }
            }
            Event::Closed(Source::ApiConn(slot)) => {
                self.api.drop_conn(slot);
                self.eloop.unregister(Source::ApiConn(slot));
            }
            Event::Closed(source) => {
                warn!("Source {source:?} failed, unregistering");
                self.eloop.unregister(source);
            }
        }
    }

    fn handle_signal(&mut self, event: SigEvent) {
        debug!("signal event: {event:?}");
        match event {
            SigEvent::Reload => self.reload(),
            SigEvent::Halt => self.begin_shutdown(HaltAction::Halt),
            SigEvent::Poweroff => self.begin_shutdown(HaltAction::Poweroff),
            SigEvent::Reboot => self.begin_shutdown(HaltAction::Reboot),
            SigEvent::Reap => self.reap_and_step(),
            SigEvent::Shutdown => self.begin_shutdown(HaltAction::Halt),
        }
    }

    /// Applies one client request and sends the reply. Public for tests and
    /// embedding; the run loop is just accept + read + this.
    pub fn handle_request(&mut self, slot: usize, request: Request) {
        let cmd = match Cmd::try_from(request.cmd) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!("{err}");
                self.api.drop_conn(slot);
                self.eloop.unregister(Source::ApiConn(slot));
                return;
            }
        };
        debug!("API request: {}", cmd.as_ref());

        match cmd {
            Cmd::Runlvl => {
                let reply = match decode_runlevel(request.runlevel) {
                    Some(level) => {
                        if level == 0 || level == 6 {
                            let action = if level == 6 {
                                HaltAction::Reboot
                            } else {
                                HaltAction::Poweroff
                            };
                            self.begin_shutdown(action);
                        } else {
                            self.enter_runlevel(level);
                        }
                        request.ack()
                    }
                    None => {
                        debug!("Unsupported runlevel request: {}", request.runlevel);
                        request.nack()
                    }
                };
                self.api.respond(slot, &reply);
            }
            Cmd::Debug => {
                self.conf.debug = !self.conf.debug;
                info!(
                    "Debug logging {}",
                    if self.conf.debug { "enabled" } else { "disabled" }
                );
                self.api.respond(slot, &request.ack());
            }
            Cmd::Reload => {
                self.reload();
                self.api.respond(slot, &request.ack());
            }
            Cmd::StartSvc | Cmd::StopSvc | Cmd::RestartSvc => {
                let failed = self.apply_job_action(cmd, &request.data_str());
                let reply = if failed == 0 {
                    request.ack()
                } else {
                    request.nack()
                };
                self.api.respond(slot, &reply);
            }
            Cmd::Emit => {
                self.handle_emit(&request.data_str());
                self.api.respond(slot, &request.ack());
            }
            Cmd::GetRunlevel => {
                let mut reply = request.ack();
                reply.runlevel = self.sched.runlevel as i32;
                reply.sleeptime = self.sched.prevlevel as i32;
                self.api.respond(slot, &reply);
            }
            Cmd::SvcIter => {
                let restart = request.runlevel != 0;
                let record = self.iter_record(slot, restart);
                self.api.send_record(slot, &record);
            }
            Cmd::SvcQuery => {
                let (failed, unmatched) = self.query_jobstr(&request.data_str());
                let mut reply = if failed == 0 {
                    request.ack()
                } else {
                    request.nack()
                };
                reply.set_data(&unmatched);
                self.api.respond(slot, &reply);
            }
            Cmd::SvcFind => {
                let record = self
                    .find_one(&request.data_str())
                    .unwrap_or_else(SvcRecord::sentinel);
                self.api.send_record(slot, &record);
            }
            Cmd::WdogHello => {
                let reply = if self.wdog_hello(request.runlevel) {
                    request.ack()
                } else {
                    request.nack()
                };
                self.api.respond(slot, &reply);
            }
            Cmd::Ack | Cmd::Nack => {
                debug!("Client failed reading reply");
                self.api.drop_conn(slot);
                self.eloop.unregister(Source::ApiConn(slot));
            }
        }
    }

    /// Polls every plugin descriptor once and converges. Lets embedders
    /// drive the supervisor without handing it the event loop.
    pub fn pump_plugins(&mut self) {
        for (index, _) in self.dispatcher.io_sources() {
            let mut ctx = PluginCtx {
                registry: &mut self.registry,
                conds: &mut self.conds,
                conf: &self.conf,
            };
            self.dispatcher.io_ready(index, &mut ctx);
        }
        self.step_all();
    }

    /// Applies start/stop/restart to every service matched by the job
    /// string. Returns the number of selectors that matched nothing.
    pub fn apply_job_action(&mut self, cmd: Cmd, jobstr: &str) -> usize {
        let mut failed = 0;
        for selector in parse_jobstr(jobstr) {
            let Ok(selector) = selector else {
                failed += 1;
                continue;
            };
            let indices = self.registry.select(&selector);
            if indices.is_empty() {
                failed += 1;
                continue;
            }
            for index in indices {
                let Some(svc) = self.registry.get_mut(index) else {
                    continue;
                };
                match cmd {
                    Cmd::StartSvc => self.sched.svc_start(svc),
                    Cmd::StopSvc => self.sched.svc_stop(svc),
                    Cmd::RestartSvc => self.sched.svc_restart(svc),
                    _ => unreachable!("jobstr action"),
                }
            }
        }
        self.step_all();
        failed
    }

    /// SVC_QUERY: collects the unmatched selectors, `name:id `-formatted.
    pub fn query_jobstr(&mut self, jobstr: &str) -> (usize, String) {
        let mut failed = 0;
        let mut unmatched = String::new();
        for selector in parse_jobstr(jobstr) {
            match selector {
                Ok(selector) => {
                    if self.registry.select(&selector).is_empty() {
                        failed += 1;
                        unmatched.push_str(&selector.unmatched());
                    }
                }
                Err(token) => {
                    failed += 1;
                    unmatched.push_str(&format!("{token} "));
                }
            }
        }
        (failed, unmatched)
    }

    /// EMIT payload: space-separated events. `+k` sets, `-k` clears, a bare
    /// token sets; the reserved word RELOAD triggers a reload.
    fn handle_emit(&mut self, payload: &str) {
        for token in payload.split_whitespace() {
            if token.eq_ignore_ascii_case("RELOAD") {
                self.reload();
            } else if let Some(key) = token.strip_prefix('+') {
                self.cond_set(key);
            } else if let Some(key) = token.strip_prefix('-') {
                self.cond_clear(key);
            } else {
                self.cond_set(token);
            }
        }
    }

    /// One SVC_ITER step on this connection's cursor.
    fn iter_record(&mut self, slot: usize, restart: bool) -> SvcRecord {
        let pos = {
            let Some(conn) = self.api.conn_mut(slot) else {
                return SvcRecord::sentinel();
            };
            if restart {
                conn.iter_pos = 0;
            }
            conn.iter_pos
        };

        match self.registry.get(pos) {
            Some(svc) => {
                let record = svc.record();
                if let Some(conn) = self.api.conn_mut(slot) {
                    conn.iter_pos = pos + 1;
                }
                record
            }
            None => SvcRecord::sentinel(),
        }
    }

    /// SVC_FIND: resolves a single selector to exactly one service.
    fn find_one(&self, input: &str) -> Option<SvcRecord> {
        let selector = Selector::parse(input.trim())?;
        let indices = self.registry.select(&selector);
        indices
            .first()
            .and_then(|&index| self.registry.get(index))
            .map(|svc| svc.record())
    }

    /// WDOG_HELLO: the caller pid takes over the watchdog role.
    fn wdog_hello(&mut self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        let Some(index) = self.registry.find_by_pid(pid) else {
            // Hand-over race: the pid is not registered (yet); drop it.
            warn!("Cannot find pid {pid}, not registered");
            return true;
        };

        let new_identity = {
            let svc = self.registry.get(index).expect("index from find_by_pid");
            (svc.spec.name.clone(), svc.spec.id.clone())
        };
        info!("Watchdog hand-over to {}:{} (pid {pid})", new_identity.0, new_identity.1);

        if let Some((name, id)) = self.wdog.take() {
            if (name.as_str(), id.as_str())
                != (new_identity.0.as_str(), new_identity.1.as_str())
            {
                if let Some(old) = self.registry.find_mut(&name, &id) {
                    info!("Stopping previous watchdog {name}:{id}");
                    old.spec.protected = false;
                    old.spec.runlevels = 0;
                    self.sched.svc_stop(old);
                }
            }
        }

        if let Some(svc) = self.registry.get_mut(index) {
            svc.spec.protected = true;
        }
        self.wdog = Some(new_identity);
        self.step_all();
        true
    }
}

/// Decodes the RUNLVL request's runlevel field: ASCII `'0'..'9'`, `'s'`/`'S'`
/// (single user) or a plain integer.
fn decode_runlevel(value: i32) -> Option<u8> {
    match value {
        0..=9 => Some(value as u8),
        v if v == 's' as i32 || v == 'S' as i32 => Some(1),
        v if (('0' as i32)..=('9' as i32)).contains(&v) => Some((v - '0' as i32) as u8),
        _ => None,
    }
}
