//! Background expiry of abandoned authorisations

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::state_machine::StandardAuthorisationProcessor;

/// Starts the expiry worker. Do not await the returned JoinHandle, as it runs
/// until aborted.
pub fn start_expiry_worker(
    processor: Arc<StandardAuthorisationProcessor>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        info!("Authorisation expiry worker started, interval {:?}", interval);
        loop {
            timer.tick().await;
            debug!("Running authorisation expiry sweep");
            match processor.sweep_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(count) => info!("{} authorisations expired", count),
                Err(e) => error!("Error running authorisation expiry sweep: {}", e),
            }
        }
    })
}
