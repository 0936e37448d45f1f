//! CLI configuration.
//!
//! Settings live in an optional `config.toml` at
//! `~/.config/sipmi/config.toml` by default:
//!
//! ```toml
//! [mi]
//! type = "datagram"
//! ip = "10.0.0.5"
//! port = 8080
//!
//! [event]
//! transport = "stream"
//! listen_ip = "10.0.0.1"
//! ```
//!
//! Command-line flags, and their `SIPMI_*` environment variables, override
//! the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use sipmi_events::{LeaseConfig, TransportConfig};
use sipmi_mi::{
    ConnectorKind, DEFAULT_FIFO_FALLBACK, DEFAULT_FIFO_FILE, DEFAULT_FIFO_REPLY_DIR,
    DatagramConfig, FifoConfig, HttpConfig, MiConfig,
};

use crate::cli::{ConnectionArgs, EventArgs, EventTransport};
use crate::error::{CliError, CliResult};

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Debug mode.
    pub debug: bool,

    /// Management interface settings.
    pub mi: MiSettings,

    /// Event listener settings.
    pub event: EventSettings,
}

/// How to reach the management interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiSettings {
    #[serde(rename = "type")]
    pub kind: ConnectorKind,

    /// Server address for the http and datagram transports.
    pub ip: String,
    pub port: u16,

    /// Full MI URL; overrides `ip` and `port` for http.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub fifo_file: PathBuf,
    pub fifo_fallback: PathBuf,
    pub fifo_reply_dir: PathBuf,

    /// Reply timeout in seconds. Each transport has its own default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
}

impl Default for MiSettings {
    fn default() -> Self {
        Self {
            kind: ConnectorKind::Fifo,
            ip: "127.0.0.1".to_string(),
            port: 8888,
            url: None,
            fifo_file: PathBuf::from(DEFAULT_FIFO_FILE),
            fifo_fallback: PathBuf::from(DEFAULT_FIFO_FALLBACK),
            fifo_reply_dir: PathBuf::from(DEFAULT_FIFO_REPLY_DIR),
            timeout: None,
        }
    }
}

impl MiSettings {
    /// Overrides settings with the flags that were given.
    pub fn apply(&mut self, args: &ConnectionArgs) {
        if let Some(kind) = args.kind {
            self.kind = kind.into();
        }
        if let Some(ref ip) = args.ip {
            self.ip = ip.clone();
            self.url = None;
        }
        if let Some(port) = args.port {
            self.port = port;
            self.url = None;
        }
        if let Some(ref path) = args.fifo_file {
            self.fifo_file = path.clone();
        }
        if let Some(ref path) = args.fifo_fallback {
            self.fifo_fallback = path.clone();
        }
        if let Some(ref dir) = args.fifo_reply_dir {
            self.fifo_reply_dir = dir.clone();
        }
        if args.timeout.is_some() {
            self.timeout = args.timeout;
        }
    }

    /// Builds the client configuration for the selected transport.
    pub fn to_mi_config(&self) -> CliResult<MiConfig> {
        let timeout = self.timeout.map(seconds).transpose()?;
        let config = match self.kind {
            ConnectorKind::Fifo => {
                let mut fifo = FifoConfig::new(&self.fifo_file)
                    .with_fallback(&self.fifo_fallback)
                    .with_reply_dir(&self.fifo_reply_dir);
                if let Some(timeout) = timeout {
                    fifo = fifo.with_timeout(timeout);
                }
                MiConfig::Fifo(fifo)
            }
            ConnectorKind::Http => {
                let mut http = match self.url {
                    Some(ref url) => HttpConfig::new(url.clone()),
                    None => HttpConfig::for_host(&self.ip, self.port),
                };
                if let Some(timeout) = timeout {
                    http = http.with_timeout(timeout);
                }
                MiConfig::Http(http)
            }
            ConnectorKind::Datagram => {
                let mut datagram = DatagramConfig::inet(self.ip.clone(), self.port);
                if let Some(timeout) = timeout {
                    datagram = datagram.with_timeout(timeout);
                }
                MiConfig::Datagram(datagram)
            }
        };
        config.validate()?;
        Ok(config)
    }
}

/// Where events are received and how long subscriptions last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub transport: EventTransport,
    pub listen_ip: String,
    pub listen_port: u16,

    /// Lease requested from the server, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<u64>,

    /// Renew this many seconds before the lease runs out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renewal_margin: Option<u64>,

    /// Random fraction of the renewal interval taken off each renewal.
    pub jitter: f64,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            transport: EventTransport::Datagram,
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 0,
            lease: None,
            renewal_margin: None,
            jitter: 0.0,
        }
    }
}

impl EventSettings {
    /// Overrides settings with the flags that were given.
    pub fn apply(&mut self, args: &EventArgs) {
        if let Some(transport) = args.transport {
            self.transport = transport;
        }
        if let Some(ref ip) = args.listen_ip {
            self.listen_ip = ip.clone();
        }
        if let Some(port) = args.listen_port {
            self.listen_port = port;
        }
    }

    /// Transport parameters for the event handler.
    pub fn transport_config(&self) -> TransportConfig {
        match self.transport {
            EventTransport::Datagram => {
                TransportConfig::datagram(self.listen_ip.clone(), self.listen_port)
            }
            EventTransport::Stream => TransportConfig::stream(self.listen_ip.clone(), self.listen_port),
        }
    }

    /// Lease renewal parameters.
    pub fn lease_config(&self) -> CliResult<LeaseConfig> {
        let defaults = LeaseConfig::default();
        let lease = self.lease.map(Duration::from_secs).unwrap_or(defaults.lease);
        let margin = self
            .renewal_margin
            .map(Duration::from_secs)
            .unwrap_or(defaults.margin);
        let config = LeaseConfig::new(lease, margin).with_jitter(self.jitter);
        config
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))?;
        Ok(config)
    }
}

impl CliConfig {
    /// Loads configuration from the default path, if the file exists.
    pub fn load() -> Result<Self, String> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sipmi")
    }
}

fn seconds(value: f64) -> CliResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| CliError::Config(format!("invalid timeout: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipmi_events::TransportKind;
    use sipmi_mi::DatagramTarget;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_sections_use_defaults() {
        let file = write_config("");
        let config = CliConfig::load_from(file.path()).unwrap();
        assert!(!config.debug);
        assert_eq!(config.mi.kind, ConnectorKind::Fifo);
        assert_eq!(config.mi.fifo_file, PathBuf::from(DEFAULT_FIFO_FILE));
        assert_eq!(config.event.listen_ip, "0.0.0.0");
        assert_eq!(config.event.transport, EventTransport::Datagram);
    }

    #[test]
    fn loads_sections() {
        let file = write_config(
            r#"
debug = true

[mi]
type = "datagram"
ip = "10.0.0.5"
port = 8080
timeout = 0.5

[event]
transport = "stream"
listen_port = 4040
lease = 600
renewal_margin = 30
"#,
        );
        let config = CliConfig::load_from(file.path()).unwrap();
        assert!(config.debug);

        let MiConfig::Datagram(datagram) = config.mi.to_mi_config().unwrap() else {
            panic!("expected datagram");
        };
        assert_eq!(
            datagram.target,
            DatagramTarget::Inet {
                host: "10.0.0.5".to_string(),
                port: 8080
            }
        );
        assert_eq!(datagram.timeout, Duration::from_millis(500));

        assert_eq!(config.event.transport_config().kind, TransportKind::Stream);
        assert_eq!(config.event.transport_config().port, 4040);
        let lease = config.event.lease_config().unwrap();
        assert_eq!(lease.lease, Duration::from_secs(600));
        assert_eq!(lease.margin, Duration::from_secs(30));
    }

    #[test]
    fn rejects_unknown_type() {
        let file = write_config("[mi]\ntype = \"pigeon\"\n");
        let err = CliConfig::load_from(file.path()).unwrap_err();
        assert!(err.contains("failed to parse config"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CliConfig::load_from(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.contains("failed to read config"));
    }

    #[test]
    fn flags_override_file() {
        let mut settings = MiSettings {
            url: Some("https://sip.example.com/mi".to_string()),
            ..Default::default()
        };
        settings.apply(&ConnectionArgs {
            kind: Some(crate::cli::MiType::Http),
            port: Some(9000),
            timeout: Some(2.0),
            ..Default::default()
        });

        let MiConfig::Http(http) = settings.to_mi_config().unwrap() else {
            panic!("expected http");
        };
        assert_eq!(http.url, "http://127.0.0.1:9000/mi");
        assert_eq!(http.timeout, Duration::from_secs(2));
    }

    #[test]
    fn url_from_file_is_kept_without_address_flags() {
        let settings = MiSettings {
            kind: ConnectorKind::Http,
            url: Some("https://sip.example.com/mi".to_string()),
            ..Default::default()
        };
        let MiConfig::Http(http) = settings.to_mi_config().unwrap() else {
            panic!("expected http");
        };
        assert_eq!(http.url, "https://sip.example.com/mi");
    }

    #[test]
    fn fifo_flags_override_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = MiSettings::default();
        settings.apply(&ConnectionArgs {
            fifo_file: Some(dir.path().join("fifo")),
            fifo_reply_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        let MiConfig::Fifo(fifo) = settings.to_mi_config().unwrap() else {
            panic!("expected fifo");
        };
        assert_eq!(fifo.fifo_file, dir.path().join("fifo"));
        assert_eq!(fifo.fifo_fallback, PathBuf::from(DEFAULT_FIFO_FALLBACK));
        assert_eq!(fifo.reply_dir, dir.path());
        assert_eq!(fifo.timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_timeouts() {
        let settings = MiSettings {
            timeout: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(settings.to_mi_config(), Err(CliError::Config(_))));

        let settings = MiSettings {
            timeout: Some(0.0),
            ..Default::default()
        };
        assert!(matches!(settings.to_mi_config(), Err(CliError::Mi(_))));
    }

    #[test]
    fn rejects_margin_not_below_lease() {
        let settings = EventSettings {
            lease: Some(60),
            renewal_margin: Some(60),
            ..Default::default()
        };
        assert!(matches!(settings.lease_config(), Err(CliError::Config(_))));
    }

    #[test]
    fn dump_roundtrips_through_toml() {
        let config = CliConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("type = \"fifo\""));
        let parsed: CliConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mi.port, 8888);
    }
}
