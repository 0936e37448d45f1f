//! `sipmi event`: print every occurrence of one event.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::info;

use sipmi_events::{Delivery, EventError, EventHandler, Lease, SubscribeOptions};
use sipmi_mi::MiClient;

use crate::cli::EventArgs;
use crate::commands::mi::pretty;
use crate::config::EventSettings;
use crate::error::{CliError, CliResult};
use crate::signals::ShutdownSignals;

/// Subscription options for the command line.
///
/// `--expire` asks the server for a fixed lease of that many seconds;
/// otherwise the lease renews itself until the process stops.
pub fn subscribe_options(settings: &EventSettings, expire: Option<u64>) -> CliResult<SubscribeOptions> {
    let lease = match expire {
        Some(secs) => Lease::Fixed(Duration::from_secs(secs)),
        None => Lease::Auto,
    };
    Ok(SubscribeOptions::default()
        .with_lease(lease)
        .with_lease_config(settings.lease_config()?))
}

/// Subscribes, prints events until a signal or the expiry, then
/// unsubscribes.
pub async fn run(mi: Arc<MiClient>, mut settings: EventSettings, args: &EventArgs) -> CliResult<()> {
    settings.apply(args);
    let options = subscribe_options(&settings, args.expire)?;
    let handler = EventHandler::new(mi, settings.transport_config())?;
    let mut signals = ShutdownSignals::install()?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    handler
        .subscribe_async(&args.event, options, move |delivery| {
            let _ = tx.send(delivery);
        })
        .await?;

    let expiry = async {
        match args.expire {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            delivery = rx.recv() => match delivery {
                Some(Delivery::Event(event)) => println!("{}", pretty(&event)?),
                Some(Delivery::Closed) | None => {
                    if expired(args.expire, started) {
                        info!(event = %args.event, "Subscription expired");
                        return Ok(());
                    }
                    return Err(CliError::Closed(args.event.clone()));
                }
            },
            _ = &mut expiry => {
                info!(event = %args.event, "Subscription expired");
                break;
            }
            _ = signals.recv() => break,
        }
    }

    match handler.unsubscribe_async(&args.event).await {
        // Already gone when the fixed lease ran out first.
        Ok(()) | Err(EventError::NotSubscribed(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn expired(expire: Option<u64>, started: Instant) -> bool {
    expire.is_some_and(|secs| started.elapsed() >= Duration::from_secs(secs))
}
