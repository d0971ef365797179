//! Exit-copy protocol: close the destination side of a mapping, resilient
//! to transient pool outages.
//!
//! The hard rule: a transport failure is evidence of nothing. Only a
//! successful snapshot may conclude that the destination position is gone.

use tracing::{debug, warn};

use router_core::error::PoolError;
use router_core::pool::PoolApi;
use router_core::types::{CloseResult, PositionMapping};

use crate::retry::RetryPolicy;

/// How an exit-copy attempt resolved.
#[derive(Debug)]
pub enum ExitOutcome {
    /// The destination position was closed by us.
    Closed(CloseResult),
    /// The destination position was confirmed gone.
    AlreadyClosed,
    /// Could not confirm either way within the policy. The mapping must be
    /// kept; the orphan reconciler revisits it.
    Unresolved,
}

/// Drive one mapping's destination close to a definitive outcome, or give
/// up after the policy's attempts.
pub async fn copy_exit(
    pool: &dyn PoolApi,
    mapping: &PositionMapping,
    policy: &RetryPolicy,
) -> ExitOutcome {
    let max_attempts = policy.max_attempts();

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_after(attempt - 1)).await;
        }
        let final_attempt = attempt == max_attempts;

        let dest_positions = match pool
            .positions(&mapping.dest_account_id, &mapping.dest_region)
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                // No snapshot, no conclusion. In particular this is NOT
                // "position not found".
                warn!(
                    dest_account = %mapping.dest_account_id,
                    dest_position = %mapping.dest_position_id,
                    attempt,
                    error = %e,
                    "snapshot failed during exit copy"
                );
                continue;
            }
        };

        let still_open = dest_positions
            .iter()
            .any(|p| p.id == mapping.dest_position_id);

        if still_open {
            match pool
                .close_position(
                    &mapping.dest_account_id,
                    &mapping.dest_region,
                    &mapping.dest_position_id,
                )
                .await
            {
                Ok(result) => return ExitOutcome::Closed(result),
                Err(PoolError::UnknownPosition) => return ExitOutcome::AlreadyClosed,
                Err(e) => {
                    warn!(
                        dest_account = %mapping.dest_account_id,
                        dest_position = %mapping.dest_position_id,
                        attempt,
                        error = %e,
                        "close failed during exit copy"
                    );
                    continue;
                }
            }
        }

        if final_attempt {
            // Confirmed absent on the last snapshot: genuinely gone.
            return ExitOutcome::AlreadyClosed;
        }
        // Absent on a non-final attempt could be a stale read; look again.
        debug!(
            dest_position = %mapping.dest_position_id,
            attempt,
            "destination position not in snapshot, re-checking"
        );
    }

    ExitOutcome::Unresolved
}
