use cyder_tools::log::{debug, info};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::service::model_cache::ModelCache;

/// Starts the periodic platform model refresh. The task exits when `shutdown` is cancelled.
pub fn spawn_model_refresh(cache: ModelCache, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(backend) = cache.platform_backend().map(str::to_string) else {
            info!("no platform backend configured, model refresh disabled");
            return;
        };
        info!("refreshing models of {} every {:?}", backend, period);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("model refresh stopped");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("model refresh tick for {}", backend);
                    cache.check_platform_models().await;
                    let stats = cache.metrics_snapshot();
                    debug!(
                        "model cache stats: hits={} misses={} writes={} errors={}",
                        stats.hits,
                        stats.misses,
                        stats.writes(),
                        stats.errors
                    );
                }
            }
        }
    })
}
