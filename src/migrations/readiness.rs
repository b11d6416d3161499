//! Readiness gate: poll the target until it answers or the deadline passes.

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use super::ledger::{BackendError, MigrationTarget};
use crate::config::ReadinessConfig;
use crate::error::MigrateError;

/// Block until `target.ping()` succeeds.
///
/// Sleeps `interval` between attempts. Each attempt is itself cut off at the
/// remaining budget so a hanging connect cannot overrun the deadline.
/// Returns the number of attempts made.
pub async fn wait_until_ready(
    target: &dyn MigrationTarget,
    readiness: &ReadinessConfig,
) -> Result<u32, MigrateError> {
    let started = Instant::now();
    let deadline = started + readiness.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let last_error = match timeout(remaining.max(readiness.interval), target.ping()).await {
            Ok(Ok(())) => {
                info!(
                    "Store {} ready after {} attempt(s)",
                    target.describe(),
                    attempts
                );
                return Ok(attempts);
            }
            Ok(Err(BackendError::ToolUnavailable(tool))) => {
                return Err(MigrateError::ToolUnavailable { tool });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "ping timed out".to_string(),
        };

        debug!("Store not ready (attempt {}): {}", attempts, last_error);

        if Instant::now() + readiness.interval > deadline {
            return Err(MigrateError::ConnectivityTimeout {
                target: target.describe(),
                waited_secs: started.elapsed().as_secs(),
                last_error,
            });
        }
        sleep(readiness.interval).await;
    }
}
