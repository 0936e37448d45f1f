//! MI connector configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MiError, MiResult};

/// Default request FIFO of the server.
pub const DEFAULT_FIFO_FILE: &str = "/var/run/opensips/opensips_fifo";

/// Request FIFO tried when [`DEFAULT_FIFO_FILE`] does not exist.
pub const DEFAULT_FIFO_FALLBACK: &str = "/tmp/opensips_fifo";

/// Directory where reply FIFOs are created.
pub const DEFAULT_FIFO_REPLY_DIR: &str = "/tmp";

/// Transport used to reach the management interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorKind {
    #[default]
    Fifo,
    Datagram,
    Http,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Datagram => "datagram",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = MiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "datagram" => Ok(Self::Datagram),
            "http" => Ok(Self::Http),
            other => Err(MiError::config(format!("invalid connector type: {}", other))),
        }
    }
}

/// Connector selection plus its parameters.
#[derive(Debug, Clone)]
pub enum MiConfig {
    Fifo(FifoConfig),
    Datagram(DatagramConfig),
    Http(HttpConfig),
}

impl MiConfig {
    /// Returns the connector kind this configuration selects.
    pub fn kind(&self) -> ConnectorKind {
        match self {
            Self::Fifo(_) => ConnectorKind::Fifo,
            Self::Datagram(_) => ConnectorKind::Datagram,
            Self::Http(_) => ConnectorKind::Http,
        }
    }

    /// Checks required parameters without touching the filesystem or network.
    pub fn validate(&self) -> MiResult<()> {
        match self {
            Self::Fifo(c) => c.validate(),
            Self::Datagram(c) => c.validate(),
            Self::Http(c) => c.validate().map(|_| ()),
        }
    }
}

/// FIFO connector settings.
#[derive(Debug, Clone)]
pub struct FifoConfig {
    /// Request FIFO the server reads commands from.
    pub fifo_file: PathBuf,
    /// Request FIFO used when `fifo_file` does not exist.
    pub fifo_fallback: PathBuf,
    /// Directory for per-command reply FIFOs. The server must resolve reply
    /// names against the same directory.
    pub reply_dir: PathBuf,
    /// Maximum wait for the reply.
    pub timeout: Duration,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self {
            fifo_file: PathBuf::from(DEFAULT_FIFO_FILE),
            fifo_fallback: PathBuf::from(DEFAULT_FIFO_FALLBACK),
            reply_dir: PathBuf::from(DEFAULT_FIFO_REPLY_DIR),
            timeout: Duration::from_secs(5),
        }
    }
}

impl FifoConfig {
    /// Creates a config for the given request FIFO, other fields default.
    pub fn new(fifo_file: impl Into<PathBuf>) -> Self {
        Self {
            fifo_file: fifo_file.into(),
            ..Default::default()
        }
    }

    /// Builder: set the fallback request FIFO.
    pub fn with_fallback(mut self, path: impl Into<PathBuf>) -> Self {
        self.fifo_fallback = path.into();
        self
    }

    /// Builder: set the reply directory.
    pub fn with_reply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reply_dir = dir.into();
        self
    }

    /// Builder: set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn validate(&self) -> MiResult<()> {
        if self.fifo_file.as_os_str().is_empty() {
            return Err(MiError::config("fifo_file is required for the FIFO connector"));
        }
        if self.fifo_fallback.as_os_str().is_empty() {
            return Err(MiError::config(
                "fifo_fallback is required for the FIFO connector",
            ));
        }
        if self.reply_dir.as_os_str().is_empty() {
            return Err(MiError::config(
                "reply_dir is required for the FIFO connector",
            ));
        }
        validate_timeout(self.timeout)
    }
}

/// Where datagram commands are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramTarget {
    /// UDP host and port.
    Inet { host: String, port: u16 },
    /// Unix datagram socket path.
    Unix(PathBuf),
}

/// Datagram connector settings.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    pub target: DatagramTarget,
    /// Maximum wait for the reply datagram.
    pub timeout: Duration,
    /// Receive buffer size; longer replies are truncated by the kernel.
    pub buffer_size: usize,
    /// Directory for the temporary reply socket of the unix variant.
    pub reply_dir: PathBuf,
}

impl DatagramConfig {
    /// UDP target.
    pub fn inet(host: impl Into<String>, port: u16) -> Self {
        Self::with_target(DatagramTarget::Inet {
            host: host.into(),
            port,
        })
    }

    /// Unix datagram target.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::with_target(DatagramTarget::Unix(path.into()))
    }

    fn with_target(target: DatagramTarget) -> Self {
        Self {
            target,
            timeout: Duration::from_millis(100),
            buffer_size: 32768,
            reply_dir: PathBuf::from(DEFAULT_FIFO_REPLY_DIR),
        }
    }

    /// Builder: set the reply timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder: set the receive buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Builder: set the directory for unix reply sockets.
    pub fn with_reply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reply_dir = dir.into();
        self
    }

    fn validate(&self) -> MiResult<()> {
        match &self.target {
            DatagramTarget::Inet { host, port } => {
                if host.is_empty() {
                    return Err(MiError::config("datagram host is required"));
                }
                if *port == 0 {
                    return Err(MiError::config("datagram port is required"));
                }
            }
            DatagramTarget::Unix(path) => {
                if path.as_os_str().is_empty() {
                    return Err(MiError::config("datagram unix socket path is required"));
                }
            }
        }
        if self.buffer_size == 0 {
            return Err(MiError::config("datagram buffer size must be positive"));
        }
        validate_timeout(self.timeout)
    }
}

/// HTTP connector settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// MI endpoint, e.g. `http://127.0.0.1:8888/mi`.
    pub url: String,
    /// Request timeout, also used for the reachability probe.
    pub timeout: Duration,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Builds the conventional `/mi` URL for a host and port.
    pub fn for_host(host: &str, port: u16) -> Self {
        Self::new(format!("http://{}:{}/mi", host, port))
    }

    /// Builder: set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parses and checks the URL.
    pub(crate) fn validate(&self) -> MiResult<Url> {
        if self.url.is_empty() {
            return Err(MiError::config("url is required for the HTTP connector"));
        }
        let url = Url::parse(&self.url)
            .map_err(|e| MiError::config(format!("invalid url {}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MiError::config(format!(
                "unsupported url scheme: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(MiError::config(format!("url has no host: {}", self.url)));
        }
        validate_timeout(self.timeout)?;
        Ok(url)
    }
}

fn validate_timeout(timeout: Duration) -> MiResult<()> {
    if timeout.is_zero() {
        return Err(MiError::config("timeout must be positive"));
    }
    Ok(())
}
