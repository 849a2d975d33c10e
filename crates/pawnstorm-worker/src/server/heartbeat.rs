use crate::server::config::CatalogConfig;
use pawnstorm_core::{Result, catalog::Heartbeat};
use tokio::{net::UdpSocket, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Announces `name` on `port` to the catalog until `shutdown` is cancelled.
///
/// The first heartbeat goes out immediately. A datagram that fails to send is
/// only logged; the catalog forgets workers that go quiet, so the next tick
/// repairs it.
pub async fn run_heartbeat(
    config: CatalogConfig,
    name: String,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let payload = serde_json::to_vec(&Heartbeat {
        role: config.role,
        owner: config.owner,
        port,
        project: name,
    })?;

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        endpoint = %config.endpoint,
        interval_secs = config.interval.as_secs(),
        "Heartbeat started"
    );

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match socket.send_to(&payload, config.endpoint.as_str()).await {
            Ok(_) => tracing::trace!(endpoint = %config.endpoint, "Heartbeat sent"),
            Err(e) => tracing::warn!(endpoint = %config.endpoint, "Heartbeat failed: {e}"),
        }
    }

    tracing::debug!("Heartbeat stopped");
    Ok(())
}
