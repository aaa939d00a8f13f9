use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use instruction_memory_core::{
    canonicalize, content_hash, evaluate_policy, is_admin_subject, AdminAction, AdminEvent,
    AuditAction, AuditDecision, DecisionId, DecisionKind, DeltaEvent, DeltaType, ProposalAction,
    ProposalEvent, AUDITS_STREAM, DELTAS_STREAM, EVENTS_STREAM,
};
use instruction_memory_store_sqlite::{
    LogMessage, MessageLog, PromoterStore, PromotionRecord, PublishAck,
};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Promoter settings, constructed once at startup and passed in by value.
#[derive(Debug, Clone)]
pub struct PromoterConfig {
    pub policy_version: String,
    pub durable: String,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self { policy_version: "promoter-1.0.0".to_string(), durable: "promoter-main".to_string() }
    }
}

/// Terminal disposition of one handled input message. Every variant is
/// acknowledged by the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Promoted { delta_type: DeltaType, ns: String, item_id: String, new_version: u32 },
    Noop { reason_code: String },
    Skipped { reason_code: String },
    Conflicted { expected: u32, actual: u32 },
    Deferred,
    Dropped,
}

/// Non-terminal dispositions. `Malformed` is acknowledged and dropped
/// (poison-message policy); `Defer` and `Infra` leave the message
/// unacknowledged for redelivery.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("deferred: {0}")]
    Defer(String),
    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

/// Consumes proposal and admin events, applies the policy gate, performs
/// content-hash based versioning with optimistic concurrency on the admin
/// path, and emits canonical deltas plus an audit trail.
pub struct Promoter {
    log: MessageLog,
    store: PromoterStore,
    config: PromoterConfig,
}

struct AuditContext {
    ns: String,
    item_id: String,
    input_event_id: String,
    input_subject: String,
    policy_version: String,
    input_hash: String,
    prior_version: u32,
    prior_hash: Option<String>,
    received_at: OffsetDateTime,
    started: Instant,
}

impl AuditContext {
    fn decision(
        &self,
        action: AuditAction,
        reason_code: &str,
        reason_detail: Option<String>,
        new_version: Option<u32>,
        is_same_hash: bool,
        delta: Option<(&DeltaEvent, &PublishAck)>,
    ) -> AuditDecision {
        let decided_at = OffsetDateTime::now_utc();
        let latency_ms =
            i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);

        AuditDecision {
            decision_id: DecisionId::new(),
            ns: self.ns.clone(),
            item_id: self.item_id.clone(),
            input_event_id: self.input_event_id.clone(),
            action,
            reason_code: reason_code.to_string(),
            reason_detail,
            policy_version: self.policy_version.clone(),
            input_subject: self.input_subject.clone(),
            input_hash: self.input_hash.clone(),
            prior_version: self.prior_version,
            prior_hash: self.prior_hash.clone(),
            new_version,
            is_same_hash,
            delta_type: delta.map(|(event, _)| event.delta_type),
            delta_subject: delta.map(|(event, _)| event.subject()),
            delta_msg_id: delta.map(|(event, _)| event.message_id()),
            delta_stream: delta.map(|(_, ack)| ack.stream.clone()),
            delta_seq: delta.map(|(_, ack)| ack.seq),
            received_at: self.received_at,
            decided_at,
            published_at: delta.map(|_| decided_at),
            latency_ms,
            emitted_at: decided_at,
        }
    }
}

impl Promoter {
    #[must_use]
    pub fn new(log: MessageLog, store: PromoterStore, config: PromoterConfig) -> Self {
        Self { log, store, config }
    }

    /// Register the durable input consumer. Repeated registration resumes
    /// from the previous position.
    ///
    /// # Errors
    /// Returns an error when the consumer cannot be registered.
    pub fn register(&self) -> Result<()> {
        self.log.create_durable(EVENTS_STREAM, &self.config.durable, ">")
    }

    /// Fetch and handle at most one input message, mapping the handler
    /// disposition to acknowledge / negative-acknowledge mechanically.
    ///
    /// # Errors
    /// Returns an error on infrastructure failures; the message stays
    /// unacknowledged and is redelivered.
    pub fn poll_once(&mut self) -> Result<Option<Outcome>> {
        let Some(message) = self.log.fetch_next(EVENTS_STREAM, &self.config.durable)? else {
            return Ok(None);
        };

        match self.handle_message(&message) {
            Ok(outcome) => {
                self.log.ack(EVENTS_STREAM, &self.config.durable, message.seq)?;
                Ok(Some(outcome))
            }
            Err(Failure::Malformed(detail)) => {
                warn!(subject = %message.subject, seq = message.seq, %detail, "dropping malformed message");
                self.log.ack(EVENTS_STREAM, &self.config.durable, message.seq)?;
                Ok(Some(Outcome::Dropped))
            }
            Err(Failure::Defer(detail)) => {
                info!(subject = %message.subject, seq = message.seq, %detail, "deferred, leaving for redelivery");
                Ok(Some(Outcome::Deferred))
            }
            Err(Failure::Infra(err)) => Err(err),
        }
    }

    /// Evaluate one input event end to end.
    ///
    /// # Errors
    /// Returns a [`Failure`] describing how the worker loop must dispose of
    /// the message.
    pub fn handle_message(&mut self, message: &LogMessage) -> Result<Outcome, Failure> {
        let started = Instant::now();
        if is_admin_subject(&message.subject) {
            self.handle_admin(message, started)
        } else {
            self.handle_proposal(message, started)
        }
    }

    fn handle_proposal(
        &mut self,
        message: &LogMessage,
        started: Instant,
    ) -> Result<Outcome, Failure> {
        let event = ProposalEvent::decode(&message.payload)
            .map_err(|err| Failure::Malformed(err.to_string()))?;
        let decision = evaluate_policy(&event);

        let canon_title = canonicalize(&event.title);
        let canon_content = canonicalize(&event.content);
        let input_hash = content_hash(&event.item_id, &event.title, &event.content);
        let event_key = event.event_key();

        let already_seen = self.store.is_seen(&event.ns, &event_key)?;
        let prior = self.store.get_item(&event.ns, &event.item_id)?;
        let base_version = prior.as_ref().map_or(0, |item| item.version);
        let is_same_active =
            prior.as_ref().is_some_and(|item| item.is_active && item.content_hash == input_hash);

        let ctx = AuditContext {
            ns: event.ns.clone(),
            item_id: event.item_id.clone(),
            input_event_id: event_key.clone(),
            input_subject: message.subject.clone(),
            policy_version: self.config.policy_version.clone(),
            input_hash: input_hash.clone(),
            prior_version: base_version,
            prior_hash: prior.as_ref().map(|item| item.content_hash.clone()),
            received_at: event.emitted_at,
            started,
        };

        match decision.kind {
            DecisionKind::Skip => {
                let reason_code = decision.reason_code();
                self.emit_audit(&ctx.decision(
                    AuditAction::Skip,
                    reason_code,
                    decision.reason.clone(),
                    None,
                    is_same_active,
                    None,
                ));
                info!(
                    ns = %event.ns,
                    item_id = %event.item_id,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "skipped proposal"
                );
                return Ok(Outcome::Skipped { reason_code: reason_code.to_string() });
            }
            DecisionKind::Defer => {
                self.emit_audit(&ctx.decision(
                    AuditAction::Defer,
                    decision.reason_code(),
                    decision.reason.clone(),
                    None,
                    is_same_active,
                    None,
                ));
                return Err(Failure::Defer(
                    decision.reason.unwrap_or_else(|| "transient condition".to_string()),
                ));
            }
            DecisionKind::Promote => {}
        }

        let (new_version, is_active_after) = match decision.action {
            ProposalAction::Retract => (base_version + 1, false),
            ProposalAction::Upsert => {
                if already_seen || is_same_active {
                    let reason_code = if already_seen { "duplicate" } else { "unchanged" };
                    self.emit_audit(&ctx.decision(
                        AuditAction::Skip,
                        reason_code,
                        Some(
                            if already_seen {
                                "duplicate (seen_events)".to_string()
                            } else {
                                "no content change".to_string()
                            },
                        ),
                        None,
                        true,
                        None,
                    ));
                    if !already_seen {
                        self.store.mark_seen(&event.ns, &event_key)?;
                    }
                    return Ok(Outcome::Noop { reason_code: reason_code.to_string() });
                }
                (base_version + 1, true)
            }
        };

        self.store.record_promotion(&PromotionRecord {
            ns: event.ns.clone(),
            item_id: event.item_id.clone(),
            version: new_version,
            title: canon_title.clone(),
            content: canon_content.clone(),
            labels: event.labels.clone(),
            content_hash: input_hash.clone(),
            is_active: is_active_after,
            policy_version: self.config.policy_version.clone(),
            source: event.source.clone(),
            input_event_id: event_key.clone(),
        })?;

        let delta = DeltaEvent {
            delta_type: if is_active_after { DeltaType::Upsert } else { DeltaType::Retract },
            ns: event.ns.clone(),
            item_id: event.item_id.clone(),
            base_version,
            new_version,
            title: is_active_after.then_some(canon_title),
            content: is_active_after.then_some(canon_content),
            labels: is_active_after.then_some(event.labels.clone()),
            input_event_id: event_key.clone(),
            input_hash: is_active_after.then_some(input_hash.clone()),
            policy_version: self.config.policy_version.clone(),
            source: event.source.clone(),
            occurred_at: event.emitted_at,
            emitted_at: OffsetDateTime::now_utc(),
        };
        let ack = self.publish_delta(&delta)?;

        self.emit_audit(&ctx.decision(
            if is_active_after { AuditAction::Upsert } else { AuditAction::Retract },
            "ok",
            None,
            Some(new_version),
            is_same_active,
            Some((&delta, &ack)),
        ));

        // Only after the publish succeeded; a crash before this point makes
        // redelivery re-evaluate the event instead of losing the delta.
        self.store.mark_seen(&event.ns, &event_key)?;

        info!(
            ns = %event.ns,
            item_id = %event.item_id,
            version = new_version,
            delta = %delta.delta_type,
            seq = ack.seq,
            "promoted"
        );

        Ok(Outcome::Promoted {
            delta_type: delta.delta_type,
            ns: event.ns,
            item_id: event.item_id,
            new_version,
        })
    }

    fn handle_admin(&mut self, message: &LogMessage, started: Instant) -> Result<Outcome, Failure> {
        let event = AdminEvent::decode(&message.payload)
            .map_err(|err| Failure::Malformed(err.to_string()))?;

        if !event.admin_metadata.bypass_review {
            return Err(Failure::Defer("admin event without bypass_review".to_string()));
        }

        let canon_title = canonicalize(&event.title);
        let canon_content = canonicalize(&event.content);
        let input_hash = content_hash(&event.item_id, &event.title, &event.content);
        let event_key = event.event_key();

        let already_seen = self.store.is_seen(&event.ns, &event_key)?;
        let prior = self.store.get_item(&event.ns, &event.item_id)?;
        let base_version = prior.as_ref().map_or(0, |item| item.version);
        let policy_version = format!("{}-admin", self.config.policy_version);

        let ctx = AuditContext {
            ns: event.ns.clone(),
            item_id: event.item_id.clone(),
            input_event_id: event_key.clone(),
            input_subject: message.subject.clone(),
            policy_version: policy_version.clone(),
            input_hash: input_hash.clone(),
            prior_version: base_version,
            prior_hash: prior.as_ref().map(|item| item.content_hash.clone()),
            received_at: event.occurred_at,
            started,
        };

        if already_seen {
            self.emit_audit(&ctx.decision(
                AuditAction::Skip,
                "duplicate",
                Some("duplicate (seen_events)".to_string()),
                None,
                false,
                None,
            ));
            return Ok(Outcome::Noop { reason_code: "duplicate".to_string() });
        }

        if event.action == AdminAction::Update {
            if let Some(expected) = event.admin_metadata.expected_version {
                if expected != base_version {
                    self.emit_audit(&ctx.decision(
                        AuditAction::Skip,
                        "admin.conflict",
                        Some(format!("version conflict: expected={expected}, actual={base_version}")),
                        None,
                        false,
                        None,
                    ));
                    warn!(
                        ns = %event.ns,
                        item_id = %event.item_id,
                        expected,
                        actual = base_version,
                        "admin version conflict"
                    );
                    return Ok(Outcome::Conflicted { expected, actual: base_version });
                }
            }
        }

        let (new_version, is_active_after, audit_action) = match event.action {
            AdminAction::Delete => {
                if prior.as_ref().is_some_and(|item| !item.is_active) {
                    self.emit_audit(&ctx.decision(
                        AuditAction::Skip,
                        "admin.already_deleted",
                        Some("item already inactive, idempotent skip".to_string()),
                        None,
                        false,
                        None,
                    ));
                    self.store.mark_seen(&event.ns, &event_key)?;
                    return Ok(Outcome::Noop { reason_code: "admin.already_deleted".to_string() });
                }
                (base_version + 1, false, AuditAction::Retract)
            }
            AdminAction::Create | AdminAction::Update => (base_version + 1, true, AuditAction::Upsert),
        };

        self.store.record_promotion(&PromotionRecord {
            ns: event.ns.clone(),
            item_id: event.item_id.clone(),
            version: new_version,
            title: canon_title.clone(),
            content: canon_content.clone(),
            labels: event.labels.clone(),
            content_hash: input_hash.clone(),
            is_active: is_active_after,
            policy_version: policy_version.clone(),
            source: event.source.clone(),
            input_event_id: event_key.clone(),
        })?;

        let delta = DeltaEvent {
            delta_type: if is_active_after { DeltaType::Upsert } else { DeltaType::Retract },
            ns: event.ns.clone(),
            item_id: event.item_id.clone(),
            base_version,
            new_version,
            title: is_active_after.then_some(canon_title),
            content: is_active_after.then_some(canon_content),
            labels: is_active_after.then_some(event.labels.clone()),
            input_event_id: event_key.clone(),
            input_hash: is_active_after.then_some(input_hash.clone()),
            policy_version,
            source: event.source.clone(),
            occurred_at: event.occurred_at,
            emitted_at: OffsetDateTime::now_utc(),
        };
        let ack = self.publish_delta(&delta)?;

        self.emit_audit(&ctx.decision(
            audit_action,
            "admin.override",
            Some(format!(
                "admin {} by {}: {}",
                event.action.as_str(),
                event.admin_metadata.user_id,
                event.admin_metadata.reason
            )),
            Some(new_version),
            false,
            Some((&delta, &ack)),
        ));

        self.store.mark_seen(&event.ns, &event_key)?;

        info!(
            ns = %event.ns,
            item_id = %event.item_id,
            version = new_version,
            action = event.action.as_str(),
            user = %event.admin_metadata.user_id,
            "admin promoted"
        );

        Ok(Outcome::Promoted {
            delta_type: delta.delta_type,
            ns: event.ns,
            item_id: event.item_id,
            new_version,
        })
    }

    fn publish_delta(&mut self, delta: &DeltaEvent) -> Result<PublishAck> {
        let payload = serde_json::to_string(delta).context("failed to serialize delta")?;
        self.log.publish(DELTAS_STREAM, &delta.subject(), Some(&delta.message_id()), &payload)
    }

    /// Audit emission is best-effort and must never fail the primary
    /// operation.
    fn emit_audit(&mut self, audit: &AuditDecision) {
        match serde_json::to_string(audit) {
            Ok(payload) => {
                if let Err(err) = self.log.publish(
                    AUDITS_STREAM,
                    &audit.subject(),
                    Some(&audit.message_id()),
                    &payload,
                ) {
                    warn!(%err, "failed to publish audit event (non-fatal)");
                }
            }
            Err(err) => warn!(%err, "failed to serialize audit event (non-fatal)"),
        }

        if let Err(err) = self.store.insert_audit(audit) {
            warn!(%err, "failed to persist audit row (non-fatal)");
        }
    }
}

/// Supervised promoter loop: strictly sequential message handling, with a
/// poll delay when the stream is idle or a message was left unacknowledged.
///
/// # Errors
/// Returns an error when consumer registration fails.
pub async fn run(
    mut promoter: Promoter,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) -> Result<()> {
    promoter.register()?;
    info!(durable = %promoter.config.durable, "promoter started");

    while !*shutdown.borrow() {
        match promoter.poll_once() {
            Ok(Some(Outcome::Deferred)) | Ok(None) => {}
            Ok(Some(_)) => continue,
            Err(err) => error!(%err, "promoter infrastructure error, will retry"),
        }

        tokio::select! {
            () = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    info!("promoter stopped");
    Ok(())
}
