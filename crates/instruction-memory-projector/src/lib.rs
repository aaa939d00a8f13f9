pub mod replay;

pub use replay::replay;

use std::time::Duration;

use anyhow::Result;
use instruction_memory_core::{DeltaEvent, DeltaType, DELTAS_STREAM};
use instruction_memory_store_sqlite::{LogMessage, MessageLog, ProjectionStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Projector settings, constructed once at startup and passed in by value.
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub durable: String,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self { durable: "delta-projector".to_string() }
    }
}

/// Disposition of one handled delta message; every variant is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied { delta_type: DeltaType, ns: String, item_id: String, new_version: u32 },
    AlreadySeen,
    Dropped,
}

/// Applies delta events to the read-optimized projection, idempotently and
/// independent of the promoter's internal ledger.
pub struct Projector {
    log: MessageLog,
    store: ProjectionStore,
    config: ProjectorConfig,
}

impl Projector {
    #[must_use]
    pub fn new(log: MessageLog, store: ProjectionStore, config: ProjectorConfig) -> Self {
        Self { log, store, config }
    }

    /// Register the durable delta consumer.
    ///
    /// # Errors
    /// Returns an error when the consumer cannot be registered.
    pub fn register(&self) -> Result<()> {
        self.log.create_durable(DELTAS_STREAM, &self.config.durable, "delta.>")
    }

    /// Fetch and apply at most one delta.
    ///
    /// # Errors
    /// Returns an error on infrastructure failures; the message stays
    /// unacknowledged and is redelivered.
    pub fn poll_once(&mut self) -> Result<Option<Outcome>> {
        let Some(message) = self.log.fetch_next(DELTAS_STREAM, &self.config.durable)? else {
            return Ok(None);
        };

        let outcome = self.handle_message(&message)?;
        self.log.ack(DELTAS_STREAM, &self.config.durable, message.seq)?;
        Ok(Some(outcome))
    }

    /// Apply one delta message. Malformed payloads are dropped under the
    /// same poison-message policy as the promoter: acknowledge with a
    /// warning, never mutate.
    ///
    /// # Errors
    /// Returns an error when the projection transaction fails.
    pub fn handle_message(&mut self, message: &LogMessage) -> Result<Outcome> {
        let delta = match DeltaEvent::decode(&message.payload) {
            Ok(delta) => delta,
            Err(err) => {
                warn!(subject = %message.subject, seq = message.seq, %err, "dropping malformed delta");
                return Ok(Outcome::Dropped);
            }
        };

        if self.store.apply(&delta)? {
            info!(
                ns = %delta.ns,
                item_id = %delta.item_id,
                version = delta.new_version,
                delta = %delta.delta_type,
                "applied delta"
            );
            Ok(Outcome::Applied {
                delta_type: delta.delta_type,
                ns: delta.ns,
                item_id: delta.item_id,
                new_version: delta.new_version,
            })
        } else {
            debug!(ns = %delta.ns, item_id = %delta.item_id, "seen delta, fast acknowledge");
            Ok(Outcome::AlreadySeen)
        }
    }

    #[must_use]
    pub fn store(&self) -> &ProjectionStore {
        &self.store
    }
}

/// Supervised projector loop, sequential like the promoter's.
///
/// # Errors
/// Returns an error when consumer registration fails.
pub async fn run(
    mut projector: Projector,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) -> Result<()> {
    projector.register()?;
    info!(durable = %projector.config.durable, "projector started");

    while !*shutdown.borrow() {
        match projector.poll_once() {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => error!(%err, "projector infrastructure error, will retry"),
        }

        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!("projector stopped");
    Ok(())
}
