//! Node agent — composes the loader, link, and health evaluator into the
//! long-running sidecar loop.
//!
//! At startup: loads registration, dials the link with `{Registration}` as
//! the first frame. Every heartbeat period: re-runs the loader (writing a
//! fresh `{Registration}` only if it changed), then evaluates health and
//! writes `{Health}`. Stops on cancellation.

use crate::health;
use crate::heartbeat::HeartbeatMessage;
use crate::link::Link;
use crate::loader::{LoadResult, Loader};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct AgentConfig {
    pub heartbeat_period: Duration,
    pub coordinator_url: String,
}

/// Runs the agent loop until `shutdown` is cancelled. Returns `Ok(())` on
/// graceful shutdown, `Err` on unrecoverable configuration failure (the
/// caller maps this to a non-zero process exit code, per the sidecar's
/// contract).
pub async fn run(
    mut loader: Loader,
    mut link: Link,
    config: AgentConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let registration = match loader.get_registration().await? {
        LoadResult::Changed(reg) => reg,
        LoadResult::Unchanged => {
            anyhow::bail!("no registration available on first load")
        }
    };
    let services = registration.services.clone();
    let dial_message = HeartbeatMessage::registration(registration);
    link.dial(&config.coordinator_url, Vec::new(), &dial_message)
        .await?;

    let mut heartbeat_ticker = tokio::time::interval(config.heartbeat_period);
    heartbeat_ticker.tick().await;
    let mut reload_sleep = Box::pin(tokio::time::sleep(loader.next_delay()));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                link.close();
                return Ok(());
            }
            () = &mut reload_sleep => {
                match loader.get_registration().await {
                    Ok(LoadResult::Changed(reg)) => {
                        let msg = HeartbeatMessage::registration(reg);
                        if let Err(e) = link.write_message(&msg).await {
                            tracing::warn!(error = %e, "failed writing updated registration");
                        }
                    }
                    Ok(LoadResult::Unchanged) => {}
                    Err(e) => tracing::warn!(error = %e, "registration reload failed"),
                }
                reload_sleep.as_mut().reset(tokio::time::Instant::now() + loader.next_delay());
            }
            _ = heartbeat_ticker.tick() => {
                let score = health::get_health(&services).await;
                let msg = HeartbeatMessage::health(crate::heartbeat::Health { score });
                if let Err(e) = link.write_message(&msg).await {
                    tracing::warn!(error = %e, "failed writing health update");
                }
            }
        }
    }
}
