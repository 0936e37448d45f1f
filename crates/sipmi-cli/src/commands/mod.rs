//! Subcommand implementations.

pub mod check;
pub mod complete;
pub mod config;
pub mod event;
pub mod mi;

use std::sync::Arc;

use sipmi_mi::MiClient;

use crate::config::MiSettings;
use crate::error::CliResult;

/// Builds the management client from resolved settings.
pub fn build_client(settings: &MiSettings) -> CliResult<Arc<MiClient>> {
    let config = settings.to_mi_config()?;
    Ok(Arc::new(MiClient::new(config)?))
}
