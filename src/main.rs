use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use pix_status_poller::config::AppConfig;
use pix_status_poller::logging::{init_tracing_with, mask_charge_id};
use pix_status_poller::payments::{
    ChargeRef, ChargeStatus, HttpPaymentGateway, InMemoryPaymentStore, PaymentRecordStore,
};
use pix_status_poller::workers::{PaymentStatusPoller, StatusListener, StopReason};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

const USAGE: &str = "usage: pix-poller <internal|external> <charge-id> [expires-at-rfc3339]";

/// Logs what a payment view would render.
struct ConsoleListener;

impl StatusListener for ConsoleListener {
    fn on_status_change(&self, status: &ChargeStatus) {
        info!(status = %status, "PIX charge status");
    }

    fn on_completed(&self) {
        info!("✅ PIX payment confirmed");
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping poller");
}

fn parse_args(args: &[String]) -> anyhow::Result<(ChargeRef, Option<DateTime<Utc>>)> {
    let (kind, id) = match args {
        [kind, id, ..] => (kind.as_str(), id.as_str()),
        _ => bail!(USAGE),
    };

    let charge_ref = match kind {
        "internal" => ChargeRef::internal(id)?,
        "external" => ChargeRef::external(id)?,
        other => bail!("unknown lookup kind '{}'; {}", other, USAGE),
    };

    let expires_at = args
        .get(2)
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| anyhow!("invalid expiry '{}': {}", raw, e))
        })
        .transpose()?;

    Ok((charge_ref, expires_at))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing_with(&config.logging);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (charge_ref, expires_at) = parse_args(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.gateway.base_url,
        charge = %mask_charge_id(charge_ref.id()),
        lookup = charge_ref.kind(),
        "🚀 Starting PIX status poller"
    );

    let gateway = Arc::new(HttpPaymentGateway::new(config.gateway.clone())?);
    let store = Arc::new(InMemoryPaymentStore::new());
    let poller = PaymentStatusPoller::builder(charge_ref, gateway, store.clone())
        .expires_at(expires_at)
        .config(config.poller.clone())
        .listener(Arc::new(ConsoleListener))
        .build()?;

    info!(
        expires_at = %poller.display_expires_at(Utc::now()).to_rfc3339(),
        explicit_expiry = expires_at.is_some(),
        "Charge countdown"
    );

    poller.start();

    let reason = tokio::select! {
        reason = poller.wait_stopped() => reason,
        _ = shutdown_signal() => {
            poller.stop();
            StopReason::Cancelled
        }
    };

    match reason {
        StopReason::Completed => {
            if let Ok(Some(record)) = store.get(poller.charge_ref().id()).await {
                info!(amount = %record.amount, status = %record.status, "Payment recorded");
            }
            Ok(())
        }
        StopReason::Cancelled => {
            info!("Poller cancelled");
            Ok(())
        }
        StopReason::Expired => {
            warn!("Charge expired before payment was confirmed");
            bail!("charge expired")
        }
        StopReason::TerminalFailure(status) => {
            warn!(status = %status, "Charge ended without payment");
            bail!("charge ended with status {}", status)
        }
    }
}
