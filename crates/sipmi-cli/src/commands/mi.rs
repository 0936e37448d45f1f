//! `sipmi mi`: run one management command.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use sipmi_mi::MiClient;

use crate::cli::MiArgs;
use crate::error::{CliError, CliResult};
use crate::signals::ShutdownSignals;

/// Method run by `--stats`.
pub const STATISTICS_METHOD: &str = "get_statistics";

/// A command and its parameters, checked before anything is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct MiRequest {
    pub method: String,
    pub params: Option<Value>,
}

impl MiRequest {
    pub fn from_args(args: &MiArgs) -> CliResult<Self> {
        if !args.stats.is_empty() {
            if args.json.is_some() {
                return Err(CliError::Usage(
                    "cannot use -s/--stats with -j/--json".to_string(),
                ));
            }
            return Ok(Self {
                method: STATISTICS_METHOD.to_string(),
                params: Some(json!({ "statistics": args.stats })),
            });
        }

        let method = args
            .command
            .clone()
            .ok_or_else(|| CliError::Usage("a command is required".to_string()))?;

        let params = match args.json {
            Some(ref text) => Some(
                serde_json::from_str(text)
                    .map_err(|e| CliError::Usage(format!("invalid JSON: {}", e)))?,
            ),
            None if args.params.is_empty() => None,
            None => Some(json!(args.params)),
        };
        Ok(Self { method, params })
    }
}

/// Runs the command and prints its result.
pub async fn run(mi: Arc<MiClient>, args: &MiArgs) -> CliResult<()> {
    let request = MiRequest::from_args(args)?;
    let result = execute(mi, request).await?;
    println!("{}", pretty(&result)?);
    Ok(())
}

/// Executes a command off the runtime. A SIGINT or SIGTERM aborts the wait
/// for the reply; the client still cleans up after itself.
pub(crate) async fn execute(mi: Arc<MiClient>, request: MiRequest) -> CliResult<Value> {
    let mut signals = ShutdownSignals::install()?;
    let interrupt = mi.interrupt_handle();
    debug!(method = %request.method, "Running MI command");

    let watcher = tokio::spawn(async move {
        signals.recv().await;
        interrupt.interrupt();
    });
    let joined =
        tokio::task::spawn_blocking(move || mi.execute(&request.method, request.params)).await;
    watcher.abort();

    let result = joined.map_err(|e| CliError::Io(std::io::Error::other(e)))?;
    Ok(result?)
}

/// Pretty-prints JSON with four-space indentation.
pub fn pretty(value: &Value) -> CliResult<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| CliError::Io(std::io::Error::other(e)))?;
    String::from_utf8(out).map_err(|e| CliError::Io(std::io::Error::other(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(command: Option<&str>) -> MiArgs {
        MiArgs {
            command: command.map(str::to_string),
            params: Vec::new(),
            json: None,
            stats: Vec::new(),
        }
    }

    #[test]
    fn command_without_params() {
        let request = MiRequest::from_args(&args(Some("uptime"))).unwrap();
        assert_eq!(request.method, "uptime");
        assert_eq!(request.params, None);
    }

    #[test]
    fn positional_params_become_an_array() {
        let mut a = args(Some("dlg_end_dlg"));
        a.params = vec!["1234".to_string(), "5678".to_string()];
        let request = MiRequest::from_args(&a).unwrap();
        assert_eq!(request.params, Some(json!(["1234", "5678"])));
    }

    #[test]
    fn json_params_are_parsed() {
        let mut a = args(Some("ds_set_state"));
        a.json = Some(r#"{"group": 1, "state": "i"}"#.to_string());
        let request = MiRequest::from_args(&a).unwrap();
        assert_eq!(request.params, Some(json!({"group": 1, "state": "i"})));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let mut a = args(Some("ds_set_state"));
        a.json = Some("{group: 1".to_string());
        let err = MiRequest::from_args(&a).unwrap_err();
        assert!(matches!(err, CliError::Usage(ref msg) if msg.starts_with("invalid JSON")));
    }

    #[test]
    fn stats_build_get_statistics() {
        let mut a = args(None);
        a.stats = vec!["shmem:".to_string(), "core:rcv_requests".to_string()];
        let request = MiRequest::from_args(&a).unwrap();
        assert_eq!(request.method, STATISTICS_METHOD);
        assert_eq!(
            request.params,
            Some(json!({"statistics": ["shmem:", "core:rcv_requests"]}))
        );
    }

    #[test]
    fn stats_with_json_is_rejected() {
        let mut a = args(None);
        a.stats = vec!["shmem:".to_string()];
        a.json = Some("{}".to_string());
        let err = MiRequest::from_args(&a).unwrap_err();
        assert!(err.to_string().contains("--stats"));
    }

    #[test]
    fn missing_command_is_rejected() {
        assert!(matches!(
            MiRequest::from_args(&args(None)),
            Err(CliError::Usage(_))
        ));
    }

    #[test]
    fn pretty_uses_four_spaces() {
        let text = pretty(&json!({"uptime": 10})).unwrap();
        assert_eq!(text, "{\n    \"uptime\": 10\n}");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = sipmi_mi::MiConfig::Fifo(
            sipmi_mi::FifoConfig::new(dir.path().join("missing"))
                .with_fallback(dir.path().join("also-missing"))
                .with_reply_dir(dir.path()),
        );
        let mi = Arc::new(MiClient::new(config).unwrap());
        let err = execute(mi, MiRequest::from_args(&args(Some("uptime"))).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Mi(ref e) if e.is_connection()));
    }
}
