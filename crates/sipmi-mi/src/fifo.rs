//! FIFO (named pipe) connector.
//!
//! Every command is one write to the server's request FIFO:
//!
//! ```text
//! :<reply fifo name>:<json command>
//! ```
//!
//! The server resolves the reply name against its own reply directory and
//! writes a single-line JSON reply into it. The reply FIFO is created by us,
//! world-writable, and removed on every exit path.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use sipmi_core::wait_readable;

use crate::client::InterruptHandle;
use crate::config::{ConnectorKind, FifoConfig};
use crate::connector::{Connector, Validation};
use crate::error::TransportError;
use crate::guard::ScopedPath;

const REPLY_PREFIX: &str = "sipmi_fifo_reply";

/// Granularity at which a pending reply wait notices interruption.
const POLL_SLICE: Duration = Duration::from_millis(100);

const RUNNING_HINT: &str = "Is the server running?";

/// Connector writing commands into the server's request FIFO.
#[derive(Debug)]
pub struct FifoConnector {
    config: FifoConfig,
    interrupt: InterruptHandle,
}

impl FifoConnector {
    pub fn new(config: FifoConfig, interrupt: InterruptHandle) -> Self {
        Self { config, interrupt }
    }

    /// Finds a request FIFO that accepts writers.
    ///
    /// Falls back to the secondary path when the primary does not exist.
    /// On failure returns the diagnostic lines for [`Validation`].
    fn probe(&self) -> Result<PathBuf, Vec<String>> {
        let fifo = if self.config.fifo_file.exists() {
            &self.config.fifo_file
        } else if self.config.fifo_fallback.exists() {
            &self.config.fifo_fallback
        } else {
            return Err(vec![
                format!(
                    "FIFO file {} does not exist, nor does fallback file {}",
                    self.config.fifo_file.display(),
                    self.config.fifo_fallback.display()
                ),
                RUNNING_HINT.to_string(),
            ]);
        };

        match open_for_write(fifo) {
            Ok(_) => Ok(fifo.clone()),
            Err(e) => {
                let mut lines = vec![format!(
                    "Could not access FIFO file {}: {}",
                    fifo.display(),
                    e
                )];
                match e.raw_os_error() {
                    Some(libc::EACCES) => {
                        if let Some(sticky) = fifo.parent().and_then(sticky_ancestor) {
                            lines.extend(protected_fifo_hint(&sticky));
                        }
                    }
                    Some(libc::ENXIO) => {
                        lines.push(format!("No process is reading it. {}", RUNNING_HINT));
                    }
                    _ => {}
                }
                Err(lines)
            }
        }
    }

    fn read_reply(&self, file: &mut File) -> Result<String, TransportError> {
        let deadline = Instant::now() + self.config.timeout;
        let mut reply = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            if self.interrupt.take() {
                return Err(TransportError::Interrupted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout("reading reply FIFO"));
            }

            let ready = wait_readable(file.as_fd(), remaining.min(POLL_SLICE))
                .map_err(|e| TransportError::io("could not wait for reply FIFO", e))?;
            if !ready {
                continue;
            }

            match file.read(&mut chunk) {
                // Nothing written yet; a hangup without data is not a reply.
                Ok(0) if reply.is_empty() => std::thread::sleep(POLL_SLICE / 10),
                Ok(0) => break,
                Ok(n) => {
                    reply.extend_from_slice(&chunk[..n]);
                    if let Some(end) = reply.iter().position(|&b| b == b'\n') {
                        reply.truncate(end + 1);
                        break;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(TransportError::io("could not read reply FIFO", e)),
            }
        }

        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

impl Connector for FifoConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Fifo
    }

    fn exchange(&self, request: &str) -> Result<String, TransportError> {
        let fifo = self.probe().map_err(|lines| {
            let lines: Vec<String> = lines.into_iter().filter(|l| l != RUNNING_HINT).collect();
            TransportError::Unavailable(lines.join("; "))
        })?;

        let name = reply_fifo_name();
        let reply_fifo = create_reply_fifo(&self.config.reply_dir.join(&name))?;

        // Open our read end before the server can try to write: a
        // non-blocking read open never waits for the peer.
        let mut reply_file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(reply_fifo.path())
            .map_err(|e| {
                TransportError::io(
                    format!("could not open reply FIFO {}", reply_fifo.path().display()),
                    e,
                )
            })?;

        write_command(&fifo, &format!(":{}:{}", name, request))?;
        debug!(fifo = %fifo.display(), reply = %name, "command written");

        let reply = self.read_reply(&mut reply_file)?;
        debug!(bytes = reply.len(), "reply received");
        Ok(reply)
    }

    fn valid(&self) -> Validation {
        match self.probe() {
            Ok(_) => Validation::valid(),
            Err(lines) => Validation::invalid(lines),
        }
    }
}

fn reply_fifo_name() -> String {
    let now = Utc::now();
    format!(
        "{}_{}_{}_{:09}",
        REPLY_PREFIX,
        std::process::id(),
        now.timestamp(),
        now.timestamp_subsec_nanos()
    )
}

/// Opens a FIFO for writing without waiting for a reader.
///
/// Fails with `ENXIO` when nobody has the FIFO open for reading.
fn open_for_write(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

fn write_command(fifo: &Path, command: &str) -> Result<(), TransportError> {
    let mut file = open_for_write(fifo).map_err(|e| match e.raw_os_error() {
        Some(libc::ENXIO) => TransportError::Unavailable(format!(
            "no process is reading FIFO file {}",
            fifo.display()
        )),
        _ => TransportError::io(format!("could not access FIFO file {}", fifo.display()), e),
    })?;
    let context = || format!("could not write to FIFO file {}", fifo.display());

    set_blocking(&file).map_err(|e| TransportError::io(context(), e))?;
    file.write_all(command.as_bytes())
        .map_err(|e| TransportError::io(context(), e))
}

fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: fcntl on an fd we own; no pointers are passed.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn create_reply_fifo(path: &Path) -> Result<ScopedPath, TransportError> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TransportError::io(
                format!("could not remove old reply FIFO file {}", path.display()),
                e,
            ));
        }
    }

    let context = || format!("could not create reply FIFO file {}", path.display());
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| TransportError::io(context(), io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) } < 0 {
        return Err(TransportError::io(context(), io::Error::last_os_error()));
    }
    let guard = ScopedPath::new(path.to_path_buf());

    // mkfifo honours the umask; the server may run as another user.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .map_err(|e| TransportError::io(context(), e))?;
    Ok(guard)
}

/// Returns the nearest ancestor (excluding `/`) with the sticky bit set.
fn sticky_ancestor(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .find(|p| {
            std::fs::metadata(p)
                .map(|m| m.mode() & 0o1000 != 0)
                .unwrap_or(false)
        })
        .map(Path::to_path_buf)
}

/// Explains the `fs.protected_fifos` mitigation that makes root unable to
/// open FIFOs owned by other users inside sticky directories.
fn protected_fifo_hint(sticky_dir: &Path) -> Vec<String> {
    vec![
        "Starting with Linux kernel 4.19, processes can no longer open FIFO files".to_string(),
        format!(
            "that live in directories with the sticky bit set (such as {})",
            sticky_dir.display()
        ),
        "and are not owned by the user the process runs as.".to_string(),
        "To fix this, either store the FIFO in a directory without the sticky bit".to_string(),
        "(such as /var/run/opensips), or disable the protection with".to_string(),
        "'sysctl fs.protected_fifos=0' (NOT RECOMMENDED).".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread::{self, JoinHandle};
    use tempfile::{TempDir, tempdir};

    fn mkfifo(path: &Path) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
    }

    fn connector(dir: &TempDir, timeout: Duration) -> (FifoConnector, PathBuf, InterruptHandle) {
        let control = dir.path().join("control_fifo");
        let config = FifoConfig::new(&control)
            .with_fallback(dir.path().join("fallback_fifo"))
            .with_reply_dir(dir.path())
            .with_timeout(timeout);
        let interrupt = InterruptHandle::default();
        (FifoConnector::new(config, interrupt.clone()), control, interrupt)
    }

    fn reply_fifos(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(REPLY_PREFIX))
            .collect()
    }

    /// Minimal server: reads one command from `control`, answers `reply`
    /// (or nothing when `None`), and returns the raw command line.
    fn spawn_server(control: PathBuf, reply_dir: PathBuf, reply: Option<String>) -> JoinHandle<String> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            // Read-write open: never blocks and never sees EOF when the
            // client's probe opens and closes the FIFO.
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&control)
                .unwrap();
            ready_tx.send(()).unwrap();

            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            let (name, command) = loop {
                let n = file.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).into_owned();
                let Some(rest) = text.strip_prefix(':') else { continue };
                let Some((name, json)) = rest.split_once(':') else { continue };
                if serde_json::from_str::<serde_json::Value>(json).is_ok() {
                    break (name.to_string(), text.clone());
                }
            };

            if let Some(reply) = reply {
                let mut out = OpenOptions::new()
                    .write(true)
                    .open(reply_dir.join(name))
                    .unwrap();
                out.write_all(reply.as_bytes()).unwrap();
                out.write_all(b"\n").unwrap();
            }
            command
        });
        ready_rx.recv().unwrap();
        handle
    }

    #[test]
    fn missing_fifo_and_fallback() {
        let dir = tempdir().unwrap();
        let (connector, _, _) = connector(&dir, Duration::from_secs(1));

        let validation = connector.valid();
        assert!(!validation.is_ok());
        assert!(validation.diagnostics()[0].contains("does not exist"));
        assert!(validation.diagnostics()[0].contains("fallback_fifo"));
        assert_eq!(validation.diagnostics()[1], RUNNING_HINT);
    }

    #[test]
    fn fifo_without_reader_is_not_valid() {
        let dir = tempdir().unwrap();
        let (connector, control, _) = connector(&dir, Duration::from_secs(1));
        mkfifo(&control);

        let validation = connector.valid();
        assert!(!validation.is_ok());
        assert!(validation.diagnostics()[0].starts_with("Could not access FIFO file"));
        assert!(validation.diagnostics()[1].contains("No process is reading"));
    }

    #[test]
    fn fallback_fifo_is_used() {
        let dir = tempdir().unwrap();
        let (connector, _, _) = connector(&dir, Duration::from_secs(1));
        let fallback = dir.path().join("fallback_fifo");
        mkfifo(&fallback);
        let _reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fallback)
            .unwrap();

        assert!(connector.valid().is_ok());
        assert_eq!(connector.probe().unwrap(), fallback);
    }

    #[test]
    fn exchange_roundtrip() {
        let dir = tempdir().unwrap();
        let (connector, control, _) = connector(&dir, Duration::from_secs(5));
        mkfifo(&control);
        let server = spawn_server(
            control,
            dir.path().to_path_buf(),
            Some(r#"{"jsonrpc":"2.0","result":{"Up time":12},"id":"1"}"#.to_string()),
        );

        let request = r#"{"jsonrpc":"2.0","id":"1","method":"uptime","params":{}}"#;
        let reply = connector.exchange(request).unwrap();
        assert_eq!(
            reply.trim_end(),
            r#"{"jsonrpc":"2.0","result":{"Up time":12},"id":"1"}"#
        );

        let command = server.join().unwrap();
        let name = command[1..].split(':').next().unwrap();
        assert!(name.starts_with(&format!("{}_{}_", REPLY_PREFIX, std::process::id())));
        assert!(command.ends_with(request));
        assert!(reply_fifos(dir.path()).is_empty());
    }

    #[test]
    fn timeout_removes_reply_fifo() {
        let dir = tempdir().unwrap();
        let (connector, control, _) = connector(&dir, Duration::from_millis(200));
        mkfifo(&control);
        let server = spawn_server(control, dir.path().to_path_buf(), None);

        let err = connector.exchange(r#"{"method":"ps"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        server.join().unwrap();
        assert!(reply_fifos(dir.path()).is_empty());
    }

    #[test]
    fn interrupt_removes_reply_fifo() {
        let dir = tempdir().unwrap();
        let (connector, control, interrupt) = connector(&dir, Duration::from_secs(30));
        mkfifo(&control);
        let server = spawn_server(control, dir.path().to_path_buf(), None);

        let trigger = interrupt.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.interrupt();
        });

        let err = connector.exchange(r#"{"method":"ps"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Interrupted));
        canceller.join().unwrap();
        server.join().unwrap();
        assert!(reply_fifos(dir.path()).is_empty());
    }

    #[test]
    fn interrupt_cancels_only_one_exchange() {
        let dir = tempdir().unwrap();
        let (connector, control, interrupt) = connector(&dir, Duration::from_secs(5));
        mkfifo(&control);

        let server = spawn_server(control.clone(), dir.path().to_path_buf(), None);
        interrupt.interrupt();
        let err = connector.exchange(r#"{"method":"ps"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Interrupted));
        assert!(!interrupt.is_interrupted());
        server.join().unwrap();

        let server = spawn_server(
            control,
            dir.path().to_path_buf(),
            Some(r#"{"jsonrpc":"2.0","result":"OK","id":"2"}"#.to_string()),
        );
        let reply = connector.exchange(r#"{"method":"ps"}"#).unwrap();
        assert_eq!(reply.trim_end(), r#"{"jsonrpc":"2.0","result":"OK","id":"2"}"#);
        server.join().unwrap();
        assert!(reply_fifos(dir.path()).is_empty());
    }

    #[test]
    fn exchange_fails_fast_without_fifo() {
        let dir = tempdir().unwrap();
        let (connector, _, _) = connector(&dir, Duration::from_secs(5));

        let err = connector.exchange("{}").unwrap_err();
        match err {
            TransportError::Unavailable(msg) => {
                assert!(msg.contains("does not exist"));
                assert!(!msg.contains(RUNNING_HINT));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(reply_fifos(dir.path()).is_empty());
    }

    #[test]
    fn finds_nearest_sticky_directory() {
        let dir = tempdir().unwrap();
        let sticky = dir.path().join("shared");
        let nested = sticky.join("run");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::set_permissions(&sticky, std::fs::Permissions::from_mode(0o1777)).unwrap();

        assert_eq!(sticky_ancestor(&nested), Some(sticky));
    }

    #[test]
    fn root_is_never_reported_as_sticky() {
        assert_eq!(sticky_ancestor(Path::new("/")), None);
    }

    #[test]
    fn protected_fifo_hint_names_directory() {
        let lines = protected_fifo_hint(Path::new("/tmp"));
        assert!(lines.iter().any(|l| l.contains("(such as /tmp)")));
        assert!(lines.iter().any(|l| l.contains("fs.protected_fifos=0")));
    }
}
