use std::time;

use thiserror::Error;
use tracing::{info, warn};

use crate::backoff::ProbeConfig;
use crate::database::Database;
use crate::metrics::{PROBE_ATTEMPTS, PROBE_FAILURES};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("could not connect to postgres after {attempts} attempts")]
pub struct ExhaustedError {
    pub attempts: u32,
}

struct ProbeState {
    attempts_made: u32,
    /// The sleep before the next attempt, always `delay_for_attempt(attempts_made)`.
    current_delay: time::Duration,
}

/// Run liveness checks against `db` until one succeeds or the attempt budget is spent.
/// Returns the attempt number that succeeded. Only the calling task sleeps between attempts.
pub async fn wait_for_ready<D>(db: &D, config: &ProbeConfig) -> Result<u32, ExhaustedError>
where
    D: Database + ?Sized,
{
    let mut state = ProbeState {
        attempts_made: 0,
        current_delay: time::Duration::ZERO,
    };

    while state.attempts_made < config.max_attempts() {
        state.attempts_made += 1;
        metrics::counter!(PROBE_ATTEMPTS).increment(1);

        match db.ping().await {
            Ok(()) => {
                info!("connected to postgres on attempt {}", state.attempts_made);
                return Ok(state.attempts_made);
            }
            Err(error) => {
                metrics::counter!(PROBE_FAILURES).increment(1);
                warn!(
                    "postgres not ready (attempt {}/{}): {}",
                    state.attempts_made,
                    config.max_attempts(),
                    error
                );

                if state.attempts_made < config.max_attempts() {
                    state.current_delay = config.delay_for_attempt(state.attempts_made);
                    tokio::time::sleep(state.current_delay).await;
                }
            }
        }
    }

    Err(ExhaustedError {
        attempts: state.attempts_made,
    })
}
