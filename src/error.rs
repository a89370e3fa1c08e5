//! Error handling for rinit.
use thiserror::Error;

/// Errors raised while reading or parsing configuration files.
#[derive(Debug, Error)]
pub enum ConfError {
    /// Error reading a configuration file or directory.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// An `include` directive referenced a file that does not exist.
    #[error("Cannot find include file '{0}', absolute path required")]
    MissingInclude(String),

    /// Error setting up the inotify watch on the configuration directories.
    #[error("Failed to watch config directories: {0}")]
    Watch(nix::errno::Errno),
}

/// Errors raised by the condition store.
#[derive(Debug, Error)]
pub enum CondError {
    /// Condition key contains path components that would escape the store.
    #[error("Illegal condition key: '{0}'")]
    IllegalKey(String),

    /// Error touching or removing the on-disk assertion file.
    #[error("Condition store I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when spawning or signalling a service child.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// fork/exec of the service command failed.
    #[error("Failed to start service '{service}': {source}")]
    Start {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The configured user or group could not be resolved.
    #[error("Unknown user or group '{0}' for service")]
    UnknownCredentials(String),

    /// Error delivering a signal to a service child.
    #[error("Failed to signal pid {pid}: {errno}")]
    Signal {
        /// Target process id.
        pid: i32,
        /// The underlying errno.
        errno: nix::errno::Errno,
    },
}

/// Errors raised by the client API server.
#[derive(Debug, Error)]
pub enum ApiError {
    /// API socket I/O error.
    #[error("API socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Request record carried the wrong magic value.
    #[error("Invalid request magic {0:#010x}")]
    BadMagic(u32),

    /// Request record was truncated or oversized.
    #[error("Invalid request length {0}")]
    BadLength(usize),

    /// Request carried an unknown command code.
    #[error("Unsupported command code {0}")]
    BadCommand(u32),

    /// Error serialising a service record for the client.
    #[error("Failed to serialise service record: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Top-level supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Configuration subsystem error.
    #[error(transparent)]
    Conf(#[from] ConfError),

    /// Condition store error.
    #[error(transparent)]
    Cond(#[from] CondError),

    /// Child process error.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Client API error.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Event loop or signal plumbing error.
    #[error("Event loop error: {0}")]
    Event(nix::errno::Errno),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for SupervisorError {
    fn from(errno: nix::errno::Errno) -> Self {
        SupervisorError::Event(errno)
    }
}
