use std::{error::Error, io};

use nix::unistd::{Pid, Uid, getpid};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rinit::{
    cli::{Cli, parse_args},
    runtime::{self, RuntimeMode},
    supervisor::{HaltAction, Options, Supervisor},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let euid = Uid::effective();
    let is_pid1 = getpid() == Pid::from_raw(1);

    let runtime_mode = if args.sys || is_pid1 {
        if !euid.is_root() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "system mode requires root privileges",
            )
            .into());
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };

    runtime::init(runtime_mode);
    init_logging(&args);

    if euid.is_root() && runtime_mode == RuntimeMode::User {
        warn!("Running as root without --sys; state will use userspace paths");
    }

    let options: Options = args.options();
    let mut supervisor = Supervisor::new(options)?;
    supervisor.bootstrap()?;
    let action = supervisor.run()?;

    conclude(action, is_pid1);
    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Completes a shutdown. As process 1 this is the point of no return; in
/// userspace mode the kernel transition is someone else's job.
fn conclude(action: HaltAction, is_pid1: bool) {
    if !is_pid1 {
        info!("Supervisor finished: {action:?}");
        return;
    }

    nix::unistd::sync();
    let cmd = match action {
        HaltAction::Halt => libc::LINUX_REBOOT_CMD_HALT,
        HaltAction::Poweroff => libc::LINUX_REBOOT_CMD_POWER_OFF,
        HaltAction::Reboot => libc::LINUX_REBOOT_CMD_RESTART,
    };
    // Safety: plain reboot(2); only reached as pid 1 on explicit shutdown.
    unsafe {
        libc::reboot(cmd);
    }
}
