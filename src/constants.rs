//! Constants and default values for the rinit supervisor.
//!
//! This module centralizes protocol constants, default timings and the
//! execution environment handed to service children.

use std::time::Duration;

// ============================================================================
// Client protocol
// ============================================================================

/// Magic value carried by every client API request record.
pub const INIT_MAGIC: u32 = 0x0309_1969;

/// Size of the opaque data area inside a request record.
pub const REQUEST_DATA_LEN: usize = 384;

/// Total wire size of a request record: magic, cmd, runlevel, sleeptime, data.
pub const REQUEST_LEN: usize = 16 + REQUEST_DATA_LEN;

// ============================================================================
// Scheduler timing and thresholds
// ============================================================================

/// Grace period between SIGTERM and SIGKILL when stopping a service.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Default periodic tick used to decay service instability counters.
pub const DEFAULT_SERVICE_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum configurable `service-interval` value, in seconds.
pub const SERVICE_INTERVAL_MAX: u64 = 1440;

/// Crashes within this window count toward the instability counter.
pub const INSTABILITY_WINDOW: Duration = Duration::from_secs(60);

/// Instability counter value at which a service becomes BLOCKED.
pub const INSTABILITY_THRESHOLD: u32 = 10;

// ============================================================================
// Configuration defaults
// ============================================================================

/// Runlevel entered after bootstrap when no `runlevel` directive is given.
pub const DEFAULT_RUNLEVEL: u8 = 2;

/// Runlevel mask applied to declarations without a `[...]` token.
pub const DEFAULT_RUNLEVELS: u16 = 0b0000_0000_0001_1100; /* [234] */

/// Hostname used when neither configuration nor /etc/hostname provide one.
pub const DEFAULT_HOSTNAME: &str = "noname";

/// Default log rotation size in bytes for redirected service output.
pub const DEFAULT_LOG_SIZE: u64 = 200_000;

/// Default number of rotated log files kept per service.
pub const DEFAULT_LOG_COUNT: u32 = 5;

/// Primary configuration file name, resolved against the config directory.
pub const CONF_FILE: &str = "rinit.conf";

/// Directory scanned for `*.conf` service declarations.
pub const CONF_RCSD: &str = "rinit.d";

// ============================================================================
// Service execution environment
// ============================================================================

/// PATH exported to every service child.
pub const EXEC_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// SHELL exported to every service child.
pub const EXEC_SHELL: &str = "/bin/sh";

/// LOGNAME and USER exported to every service child.
pub const EXEC_USER: &str = "root";

/// Suffix identifying pidfiles in the watched run directory.
pub const PIDFILE_SUFFIX: &str = ".pid";

// ============================================================================
// Supervisor runtime artifacts
// ============================================================================

/// Name of the API socket inside the state directory.
pub const API_SOCKET_NAME: &str = "initctl.sock";

/// Name of the supervisor's own pidfile inside the state directory.
pub const SUPERVISOR_PID_NAME: &str = "rinit.pid";
