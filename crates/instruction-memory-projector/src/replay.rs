use std::time::Instant;

use anyhow::Result;
use instruction_memory_core::{DeltaEvent, ReplayResult, DELTAS_STREAM};
use instruction_memory_store_sqlite::{MessageLog, ProjectionStore};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// Reconstruct a namespace projection from nothing but the delta log and
/// report the resulting state fingerprint.
///
/// The log is read through a position-less, from-the-beginning reader:
/// replay is stateless and must restart from sequence 1 on every
/// invocation, and concurrent replays must not interfere with each other
/// or with the live projector's durable consumer. The target projection is
/// expected to be fresh (see [`ProjectionStore::open_for_replay`]); no
/// idempotency ledger is consulted because replay is a single linear pass
/// over an ordered log with no retries. Each delta commits on its own, so
/// an interrupted replay leaves a consistent prefix.
///
/// # Errors
/// Returns an error when log reads or projection writes fail.
pub fn replay(
    log: &MessageLog,
    projection: &mut ProjectionStore,
    ns: &str,
    max_sequence: Option<i64>,
) -> Result<ReplayResult> {
    let started_at = OffsetDateTime::now_utc();
    let started = Instant::now();
    let filter = format!("delta.{ns}.>");

    info!(ns, ?max_sequence, "replay started");

    let messages = log.read_from_start(DELTAS_STREAM, &filter, max_sequence)?;

    let mut events_processed: u64 = 0;
    for message in &messages {
        let delta = match DeltaEvent::decode(&message.payload) {
            Ok(delta) => delta,
            Err(err) => {
                warn!(seq = message.seq, %err, "skipping malformed delta during replay");
                continue;
            }
        };
        if delta.ns != ns {
            continue;
        }

        projection.apply_unchecked(&delta)?;
        events_processed += 1;

        if events_processed % 100 == 0 {
            debug!(ns, events_processed, "replay progress");
        }
    }

    let snapshot = projection.state_snapshot(ns)?;
    let completed_at = OffsetDateTime::now_utc();
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    info!(
        ns,
        events_processed,
        active_count = snapshot.active_count,
        state_hash = %snapshot.state_hash,
        elapsed_ms,
        "replay completed"
    );

    Ok(ReplayResult {
        ns: ns.to_string(),
        events_processed,
        active_count: snapshot.active_count,
        state_hash: snapshot.state_hash,
        elapsed_ms,
        started_at,
        completed_at,
    })
}
