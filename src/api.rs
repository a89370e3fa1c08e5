//! Client API server: UNIX stream socket speaking fixed-size records.
//!
//! Every request is one 400-byte record (magic, command, runlevel,
//! sleeptime, 384-byte data area). Replies reuse the record with the command
//! replaced by ACK/NACK; SVC_ITER and SVC_FIND stream one serialised service
//! record per request instead. Connections are nonblocking; slow clients are
//! dropped rather than buffered.

use std::{
    fs,
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
    os::unix::{
        fs::PermissionsExt,
        net::{UnixListener, UnixStream},
    },
    path::PathBuf,
};

use tracing::{debug, warn};

use crate::{
    constants::{INIT_MAGIC, REQUEST_DATA_LEN, REQUEST_LEN},
    error::ApiError,
    svc::SvcRecord,
};

/// Command codes of the client protocol. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr)]
#[repr(u32)]
pub enum Cmd {
    /// Change runlevel; 0 and 6 set halt/reboot intent.
    Runlvl = 1,
    /// Toggle debug logging.
    Debug = 2,
    /// Reload configuration.
    Reload = 3,
    /// Start services matched by the job-string payload.
    StartSvc = 4,
    /// Stop services matched by the payload.
    StopSvc = 5,
    /// Restart services matched by the payload.
    RestartSvc = 6,
    /// Space-separated condition events: `+k` set, `-k` clear, bare set.
    Emit = 7,
    /// Reply with current and previous runlevel.
    GetRunlevel = 8,
    /// Walk the registry, one service record per request.
    SvcIter = 9,
    /// Report unresolved job-string selectors.
    SvcQuery = 10,
    /// Return exactly one service record or a sentinel.
    SvcFind = 11,
    /// Hand the watchdog role to the caller pid.
    WdogHello = 12,
    /// Positive reply.
    Ack = 20,
    /// Negative reply.
    Nack = 21,
}

impl TryFrom<u32> for Cmd {
    type Error = ApiError;

    fn try_from(value: u32) -> Result<Self, ApiError> {
        let cmd = match value {
            1 => Cmd::Runlvl,
            2 => Cmd::Debug,
            3 => Cmd::Reload,
            4 => Cmd::StartSvc,
            5 => Cmd::StopSvc,
            6 => Cmd::RestartSvc,
            7 => Cmd::Emit,
            8 => Cmd::GetRunlevel,
            9 => Cmd::SvcIter,
            10 => Cmd::SvcQuery,
            11 => Cmd::SvcFind,
            12 => Cmd::WdogHello,
            20 => Cmd::Ack,
            21 => Cmd::Nack,
            other => return Err(ApiError::BadCommand(other)),
        };
        Ok(cmd)
    }
}

/// One fixed-size protocol record.
#[derive(Clone)]
pub struct Request {
    pub cmd: u32,
    pub runlevel: i32,
    pub sleeptime: i32,
    pub data: [u8; REQUEST_DATA_LEN],
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("cmd", &self.cmd)
            .field("runlevel", &self.runlevel)
            .field("sleeptime", &self.sleeptime)
            .field("data", &self.data_str())
            .finish()
    }
}

impl Request {
    pub fn new(cmd: Cmd) -> Self {
        Request {
            cmd: cmd as u32,
            runlevel: 0,
            sleeptime: 0,
            data: [0; REQUEST_DATA_LEN],
        }
    }

    pub fn with_data(cmd: Cmd, data: &str) -> Self {
        let mut request = Self::new(cmd);
        request.set_data(data);
        request
    }

    /// NUL-terminated view of the data area.
    pub fn data_str(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(REQUEST_DATA_LEN);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    /// Copies `data` into the data area, truncating to fit.
    pub fn set_data(&mut self, data: &str) {
        self.data = [0; REQUEST_DATA_LEN];
        let bytes = data.as_bytes();
        let len = bytes.len().min(REQUEST_DATA_LEN - 1);
        self.data[..len].copy_from_slice(&bytes[..len]);
    }

    /// Turns the record into its ACK reply.
    pub fn ack(mut self) -> Self {
        self.cmd = Cmd::Ack as u32;
        self
    }

    /// Turns the record into its NACK reply.
    pub fn nack(mut self) -> Self {
        self.cmd = Cmd::Nack as u32;
        self
    }

    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&INIT_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.cmd.to_le_bytes());
        buf[8..12].copy_from_slice(&self.runlevel.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sleeptime.to_le_bytes());
        buf[16..].copy_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ApiError> {
        if buf.len() != REQUEST_LEN {
            return Err(ApiError::BadLength(buf.len()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().expect("sized slice"));
        if magic != INIT_MAGIC {
            return Err(ApiError::BadMagic(magic));
        }

        let mut data = [0u8; REQUEST_DATA_LEN];
        data.copy_from_slice(&buf[16..]);
        Ok(Request {
            cmd: u32::from_le_bytes(buf[4..8].try_into().expect("sized slice")),
            runlevel: i32::from_le_bytes(buf[8..12].try_into().expect("sized slice")),
            sleeptime: i32::from_le_bytes(buf[12..16].try_into().expect("sized slice")),
            data,
        })
    }
}

/// Outcome of attempting to read one record from a connection.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A full, valid record.
    Request(Request),
    /// Nothing to read yet; the connection stays registered.
    Again,
    /// Peer closed or misbehaved; the connection is gone.
    Closed,
}

/// One accepted client connection with its per-connection iteration cursor.
#[derive(Debug)]
pub struct Conn {
    stream: UnixStream,
    /// SVC_ITER position. Intentionally per connection, not process-global.
    pub iter_pos: usize,
}

/// The API listener and its live connections.
#[derive(Debug)]
pub struct ApiServer {
    listener: UnixListener,
    path: PathBuf,
    conns: Vec<Option<Conn>>,
}

impl ApiServer {
    /// Binds the socket (mode 0600), replacing any stale one.
    pub fn bind(path: PathBuf) -> Result<Self, ApiError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;

        debug!("API socket listening on {}", path.display());
        Ok(ApiServer {
            listener,
            path,
            conns: Vec::new(),
        })
    }

    /// Closes everything and binds a fresh socket. Used after loop errors.
    pub fn rebind(&mut self) -> Result<(), ApiError> {
        let fresh = Self::bind(self.path.clone())?;
        *self = fresh;
        Ok(())
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts one pending connection, returning its slot index.
    pub fn accept(&mut self) -> Option<usize> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    warn!("API client setup failed: {err}");
                    return None;
                }
                let conn = Conn {
                    stream,
                    iter_pos: 0,
                };
                let slot = self.conns.iter().position(Option::is_none);
                match slot {
                    Some(slot) => {
                        self.conns[slot] = Some(conn);
                        Some(slot)
                    }
                    None => {
                        self.conns.push(Some(conn));
                        Some(self.conns.len() - 1)
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!("API accept failed: {err}");
                None
            }
        }
    }

    pub fn conn_fd(&self, slot: usize) -> Option<RawFd> {
        self.conns
            .get(slot)
            .and_then(Option::as_ref)
            .map(|conn| conn.stream.as_raw_fd())
    }

    pub fn conn_mut(&mut self, slot: usize) -> Option<&mut Conn> {
        self.conns.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn drop_conn(&mut self, slot: usize) {
        if let Some(entry) = self.conns.get_mut(slot) {
            *entry = None;
        }
    }

    /// Reads exactly one record. A partial record from a slow client drops
    /// the connection rather than buffering it.
    pub fn read_request(&mut self, slot: usize) -> ReadOutcome {
        let Some(conn) = self.conn_mut(slot) else {
            return ReadOutcome::Closed;
        };

        let mut buf = [0u8; REQUEST_LEN];
        let mut filled = 0;
        while filled < REQUEST_LEN {
            match conn.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.drop_conn(slot);
                    return ReadOutcome::Closed;
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if filled == 0 {
                        // Spurious wakeup; keep the connection.
                        return ReadOutcome::Again;
                    }
                    warn!("Dropping slow API client ({filled}/{REQUEST_LEN} bytes)");
                    self.drop_conn(slot);
                    return ReadOutcome::Closed;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("API client read failed: {err}");
                    self.drop_conn(slot);
                    return ReadOutcome::Closed;
                }
            }
        }

        match Request::from_bytes(&buf) {
            Ok(request) => ReadOutcome::Request(request),
            Err(err) => {
                warn!("Invalid API request: {err}");
                self.drop_conn(slot);
                ReadOutcome::Closed
            }
        }
    }

    /// Writes a reply record; a blocked or broken client is dropped.
    pub fn respond(&mut self, slot: usize, reply: &Request) {
        let Some(conn) = self.conn_mut(slot) else { return };
        if let Err(err) = conn.stream.write_all(&reply.to_bytes()) {
            debug!("Dropping API client on write: {err}");
            self.drop_conn(slot);
        }
    }

    /// Writes one serialised service record (SVC_ITER / SVC_FIND reply).
    pub fn send_record(&mut self, slot: usize, record: &SvcRecord) {
        let payload = match serde_json::to_vec(record) {
            Ok(mut payload) => {
                payload.push(b'\n');
                payload
            }
            Err(err) => {
                warn!("Failed to serialise service record: {err}");
                return;
            }
        };
        let Some(conn) = self.conn_mut(slot) else { return };
        if let Err(err) = conn.stream.write_all(&payload) {
            debug!("Dropping API client on record write: {err}");
            self.drop_conn(slot);
        }
    }
}
