//! `sipmi check`: run the reachability probe.

use std::sync::Arc;

use sipmi_mi::{MiClient, Validation};

use crate::error::{CliError, CliResult};

pub async fn run(mi: Arc<MiClient>) -> CliResult<()> {
    let kind = mi.kind();
    let validation = tokio::task::spawn_blocking(move || mi.valid().clone())
        .await
        .map_err(|e| CliError::Io(std::io::Error::other(e)))?;

    for line in report(&kind.to_string(), &validation) {
        println!("{}", line);
    }
    if validation.is_ok() {
        Ok(())
    } else {
        Err(CliError::Unhealthy)
    }
}

fn report(kind: &str, validation: &Validation) -> Vec<String> {
    if validation.is_ok() {
        return vec![format!("{} management interface is usable", kind)];
    }
    let mut lines = vec![format!("{} management interface is not usable:", kind)];
    lines.extend(validation.diagnostics().iter().map(|d| format!("  {}", d)));
    lines
}
