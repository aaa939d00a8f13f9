use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

/// Stream holding raw proposal and admin input events.
pub const EVENTS_STREAM: &str = "EVENTS";
/// Stream holding canonical delta events, the sole input to projections and replay.
pub const DELTAS_STREAM: &str = "DELTAS";
/// Stream holding best-effort promoter decision audit events.
pub const AUDITS_STREAM: &str = "AUDITS";

/// Trailer key that may carry an action override on a proposal.
pub const ACTION_TRAILER: &str = "Im-Action";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DecisionId(pub Ulid);

impl DecisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DecisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalize text prior to hashing: CRLF to LF, outer trim, and runs of
/// spaces/tabs collapsed to a single space. Insignificant formatting
/// differences must not trigger spurious versions.
#[must_use]
pub fn canonicalize(text: &str) -> String {
    let unified = text.replace("\r\n", "\n");
    let trimmed = unified.trim();

    let mut out = String::with_capacity(trimmed.len());
    let mut in_blank_run = false;
    for ch in trimmed.chars() {
        if ch == ' ' || ch == '\t' {
            if !in_blank_run {
                out.push(' ');
                in_blank_run = true;
            }
        } else {
            out.push(ch);
            in_blank_run = false;
        }
    }
    out
}

/// Stable content fingerprint over the canonical title and content of one item.
#[must_use]
pub fn content_hash(item_id: &str, title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(item_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonicalize(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(canonicalize(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    Upsert,
    Retract,
}

impl ProposalAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Retract => "retract",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "upsert" => Some(Self::Upsert),
            "retract" => Some(Self::Retract),
            _ => None,
        }
    }
}

/// Provenance of an item's content: where the proposed text came from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceInfo {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub path: String,
    pub blob_sha: String,
}

impl SourceInfo {
    /// Synthetic provenance stamped onto admin-originated events.
    #[must_use]
    pub fn admin_override(path: impl Into<String>, blob_sha: impl Into<String>) -> Self {
        Self {
            repo: "admin.override".to_string(),
            git_ref: "manual".to_string(),
            path: path.into(),
            blob_sha: blob_sha.into(),
        }
    }
}

/// Untrusted input requesting a content change, subject to policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposalEvent {
    pub ns: String,
    pub item_id: String,
    pub proposal_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ProposalAction>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub trailers: BTreeMap<String, String>,
    pub source: SourceInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub emitted_at: OffsetDateTime,
}

impl ProposalEvent {
    /// Strictly decode a proposal payload. Missing or blank required fields
    /// reject the event before any policy evaluation; a half-populated
    /// event is never produced.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] for malformed JSON and
    /// [`CoreError::Validation`] for blank required fields.
    pub fn decode(payload: &str) -> Result<Self, CoreError> {
        let event: Self =
            serde_json::from_str(payload).map_err(|err| CoreError::Decode(err.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when a required field is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in
            [("ns", &self.ns), ("item_id", &self.item_id), ("proposal_id", &self.proposal_id)]
        {
            if value.trim().is_empty() {
                return Err(CoreError::Validation(format!("{name} MUST be provided")));
            }
        }
        Ok(())
    }

    /// Action resolution order: explicit field, then the trailer override,
    /// then the upsert default.
    #[must_use]
    pub fn resolved_action(&self) -> ProposalAction {
        if let Some(action) = self.action {
            return action;
        }
        self.trailers
            .get(ACTION_TRAILER)
            .and_then(|value| ProposalAction::parse(value))
            .unwrap_or(ProposalAction::Upsert)
    }

    /// Idempotency key of this submission for a given item.
    #[must_use]
    pub fn event_key(&self) -> String {
        format!("{}-{}", self.proposal_id, self.item_id)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DecisionKind {
    Promote,
    Skip,
    Defer,
}

/// Pure outcome of the policy gate over one proposal. No side effects, no I/O.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PolicyDecision {
    pub kind: DecisionKind,
    pub action: ProposalAction,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn promote(action: ProposalAction) -> Self {
        Self { kind: DecisionKind::Promote, action, reason: None }
    }

    fn skip(action: ProposalAction, reason: impl Into<String>) -> Self {
        Self { kind: DecisionKind::Skip, action, reason: Some(reason.into()) }
    }

    /// Stable machine-readable code for the audit trail.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self.kind {
            DecisionKind::Promote => "ok",
            DecisionKind::Defer => "defer:transient",
            DecisionKind::Skip => match self.reason.as_deref() {
                Some("non-main branch") => "branch:not-main",
                Some("experimental content") => "experimental",
                Some(reason) if reason.starts_with("ci=") => "ci:not-green",
                _ => "skip:other",
            },
        }
    }
}

fn is_main_ref(git_ref: &str) -> bool {
    let lowered = git_ref.trim().to_ascii_lowercase();
    lowered == "main"
        || lowered == "master"
        || lowered.ends_with("/main")
        || lowered.ends_with("/master")
}

/// Gate a proposal: branch, labels, and CI status, in fixed priority order.
/// Admin events bypass this gate entirely.
#[must_use]
pub fn evaluate_policy(event: &ProposalEvent) -> PolicyDecision {
    let action = event.resolved_action();

    if !is_main_ref(&event.source.git_ref) {
        return PolicyDecision::skip(action, "non-main branch");
    }

    if event.labels.iter().any(|label| label.eq_ignore_ascii_case("experimental")) {
        return PolicyDecision::skip(action, "experimental content");
    }

    if let Some(ci) = event.ci.as_deref() {
        if !ci.eq_ignore_ascii_case("green") && !ci.eq_ignore_ascii_case("n/a") {
            return PolicyDecision::skip(action, format!("ci={ci}"));
        }
    }

    PolicyDecision::promote(action)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Create,
    Update,
    Delete,
}

impl AdminAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdminMetadata {
    pub user_id: String,
    pub reason: String,
    #[serde(default = "default_bypass_review")]
    pub bypass_review: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u32>,
}

fn default_bypass_review() -> bool {
    true
}

/// Administrative override event. Bypasses the policy gate but is subject
/// to optimistic-concurrency conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminEvent {
    pub ns: String,
    pub item_id: String,
    pub action: AdminAction,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub admin_metadata: AdminMetadata,
    pub source: SourceInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub event_id: String,
}

impl AdminEvent {
    /// Strictly decode an admin envelope.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] for malformed JSON and
    /// [`CoreError::Validation`] for blank required fields.
    pub fn decode(payload: &str) -> Result<Self, CoreError> {
        let event: Self =
            serde_json::from_str(payload).map_err(|err| CoreError::Decode(err.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] when a required field is blank.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in
            [("ns", &self.ns), ("item_id", &self.item_id), ("event_id", &self.event_id)]
        {
            if value.trim().is_empty() {
                return Err(CoreError::Validation(format!("{name} MUST be provided")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn event_key(&self) -> String {
        format!("{}-{}", self.event_id, self.item_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum DeltaType {
    #[serde(rename = "im.upsert.v1")]
    Upsert,
    #[serde(rename = "im.retract.v1")]
    Retract,
}

impl DeltaType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "im.upsert.v1",
            Self::Retract => "im.retract.v1",
        }
    }
}

impl Display for DeltaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical post-policy event representing one accepted upsert or retract.
/// The delta log is the sole channel of truth between the promoter and all
/// projections and replays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaEvent {
    #[serde(rename = "type")]
    pub delta_type: DeltaType,
    pub ns: String,
    pub item_id: String,
    pub base_version: u32,
    pub new_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
    pub input_event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    pub policy_version: String,
    pub source: SourceInfo,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub emitted_at: OffsetDateTime,
}

impl DeltaEvent {
    /// Strictly decode a delta payload. An upsert without title and content
    /// is malformed.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] for malformed JSON and
    /// [`CoreError::Validation`] for structurally invalid deltas.
    pub fn decode(payload: &str) -> Result<Self, CoreError> {
        let delta: Self =
            serde_json::from_str(payload).map_err(|err| CoreError::Decode(err.to_string()))?;
        delta.validate()?;
        Ok(delta)
    }

    /// # Errors
    /// Returns [`CoreError::Validation`] for blank identity fields or an
    /// upsert missing its content.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in [("ns", &self.ns), ("item_id", &self.item_id)] {
            if value.trim().is_empty() {
                return Err(CoreError::Validation(format!("{name} MUST be provided")));
            }
        }
        if self.delta_type == DeltaType::Upsert && (self.title.is_none() || self.content.is_none())
        {
            return Err(CoreError::Validation(
                "upsert delta MUST carry title and content".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic publish identity: re-publishing the identical delta is
    /// recognized as a duplicate by the transport itself.
    #[must_use]
    pub fn message_id(&self) -> String {
        format!("delta:{}:{}:v{}:{}", self.ns, self.item_id, self.new_version, self.delta_type)
    }

    #[must_use]
    pub fn subject(&self) -> String {
        delta_subject(&self.ns, self.delta_type)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Upsert,
    Retract,
    Skip,
    Defer,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Retract => "retract",
            Self::Skip => "skip",
            Self::Defer => "defer",
        }
    }
}

/// One append-only audit fact per evaluated input event, written for every
/// decision kind so the policy is auditable independent of the projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditDecision {
    pub decision_id: DecisionId,
    pub ns: String,
    pub item_id: String,
    pub input_event_id: String,
    pub action: AuditAction,
    pub reason_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_detail: Option<String>,
    pub policy_version: String,
    pub input_subject: String,
    pub input_hash: String,
    pub prior_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<u32>,
    pub is_same_hash: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_type: Option<DeltaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_seq: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub published_at: Option<OffsetDateTime>,
    pub latency_ms: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub emitted_at: OffsetDateTime,
}

impl AuditDecision {
    #[must_use]
    pub fn message_id(&self) -> String {
        format!("audit:{}:{}", self.ns, self.decision_id)
    }

    #[must_use]
    pub fn subject(&self) -> String {
        audit_subject(&self.ns)
    }
}

/// Outcome of one stateless replay run. Produced fresh per run and never
/// persisted as authoritative state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayResult {
    pub ns: String,
    pub events_processed: u64,
    pub active_count: i64,
    pub state_hash: String,
    pub elapsed_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[must_use]
pub fn proposal_subject(ns: &str, item_id: &str) -> String {
    format!("proposal.{ns}.{item_id}")
}

#[must_use]
pub fn admin_subject(action: AdminAction, ns: &str, item_id: &str) -> String {
    format!("admin.{}.{ns}.{item_id}", action.as_str())
}

#[must_use]
pub fn delta_subject(ns: &str, delta_type: DeltaType) -> String {
    match delta_type {
        DeltaType::Upsert => format!("delta.{ns}.im.upsert.v1"),
        DeltaType::Retract => format!("delta.{ns}.im.retract.v1"),
    }
}

#[must_use]
pub fn audit_subject(ns: &str) -> String {
    format!("audit.{ns}.promoter.decision.v1")
}

#[must_use]
pub fn is_admin_subject(subject: &str) -> bool {
    subject.starts_with("admin.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn fixture_source(git_ref: &str) -> SourceInfo {
        SourceInfo {
            repo: "acme/handbook".to_string(),
            git_ref: git_ref.to_string(),
            path: "im/api/auth.md".to_string(),
            blob_sha: "2c26b46b68ffc68ff99b453c1d304134".to_string(),
        }
    }

    fn fixture_proposal(git_ref: &str, ci: Option<&str>) -> ProposalEvent {
        ProposalEvent {
            ns: "acme".to_string(),
            item_id: "api.auth".to_string(),
            proposal_id: "b1946ac92492d2347c6235b4d2611184".to_string(),
            ci: ci.map(str::to_string),
            action: None,
            title: "Auth".to_string(),
            content: "Use OAuth2.".to_string(),
            labels: BTreeSet::new(),
            trailers: BTreeMap::new(),
            source: fixture_source(git_ref),
            emitted_at: fixture_time(),
        }
    }

    // Test IDs: TCAN-001
    #[test]
    fn canonicalize_normalizes_line_endings_and_blank_runs() {
        assert_eq!(canonicalize("a\r\nb"), "a\nb");
        assert_eq!(canonicalize("  a \t b  "), "a b");
        assert_eq!(canonicalize("a\t\t\tb"), "a b");
        assert_eq!(canonicalize("\n\n"), "");
    }

    // Test IDs: TCAN-002
    #[test]
    fn canonicalize_preserves_newlines_between_lines() {
        assert_eq!(canonicalize("line one   \nline  two"), "line one \nline two");
    }

    // Test IDs: THSH-001
    #[test]
    fn content_hash_ignores_insignificant_formatting() {
        let a = content_hash("api.auth", "Auth", "Use  OAuth2.");
        let b = content_hash("api.auth", "Auth", "Use OAuth2.");
        let c = content_hash("api.auth", "Auth", "Use OAuth2 or mTLS.");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    // Test IDs: THSH-002
    #[test]
    fn content_hash_binds_the_item_identity() {
        let a = content_hash("api.auth", "Auth", "Use OAuth2.");
        let b = content_hash("api.tls", "Auth", "Use OAuth2.");
        assert_ne!(a, b);
    }

    // Test IDs: TPOL-001
    #[test]
    fn non_main_branch_is_skipped() {
        let event = fixture_proposal("refs/heads/feature/x", Some("green"));
        let decision = evaluate_policy(&event);
        assert_eq!(decision.kind, DecisionKind::Skip);
        assert_eq!(decision.reason.as_deref(), Some("non-main branch"));
        assert_eq!(decision.reason_code(), "branch:not-main");
    }

    // Test IDs: TPOL-002
    #[test]
    fn experimental_label_is_skipped() {
        let mut event = fixture_proposal("refs/heads/main", Some("green"));
        event.labels.insert("Experimental".to_string());
        let decision = evaluate_policy(&event);
        assert_eq!(decision.kind, DecisionKind::Skip);
        assert_eq!(decision.reason_code(), "experimental");
    }

    // Test IDs: TPOL-003
    #[test]
    fn red_ci_is_skipped_with_status_in_reason() {
        let event = fixture_proposal("main", Some("red"));
        let decision = evaluate_policy(&event);
        assert_eq!(decision.kind, DecisionKind::Skip);
        assert_eq!(decision.reason.as_deref(), Some("ci=red"));
        assert_eq!(decision.reason_code(), "ci:not-green");
    }

    // Test IDs: TPOL-004
    #[test]
    fn green_and_not_applicable_ci_promote() {
        for ci in [Some("green"), Some("n/a"), None] {
            let event = fixture_proposal("refs/heads/master", ci);
            let decision = evaluate_policy(&event);
            assert_eq!(decision.kind, DecisionKind::Promote, "ci={ci:?}");
            assert_eq!(decision.action, ProposalAction::Upsert);
        }
    }

    // Test IDs: TPOL-005
    #[test]
    fn trailer_override_resolves_retract_action() {
        let mut event = fixture_proposal("main", Some("green"));
        event.trailers.insert(ACTION_TRAILER.to_string(), "Retract".to_string());
        let decision = evaluate_policy(&event);
        assert_eq!(decision.kind, DecisionKind::Promote);
        assert_eq!(decision.action, ProposalAction::Retract);
    }

    // Test IDs: TPOL-006
    #[test]
    fn explicit_action_wins_over_trailer() {
        let mut event = fixture_proposal("main", Some("green"));
        event.action = Some(ProposalAction::Upsert);
        event.trailers.insert(ACTION_TRAILER.to_string(), "retract".to_string());
        assert_eq!(event.resolved_action(), ProposalAction::Upsert);
    }

    // Test IDs: TDEC-001
    #[test]
    fn proposal_decode_rejects_missing_required_fields() {
        let payload = serde_json::json!({
            "ns": "acme",
            "item_id": "api.auth",
            "title": "Auth",
            "content": "Use OAuth2.",
            "source": {"repo": "r", "ref": "main", "path": "p", "blob_sha": "s"},
            "emitted_at": "2026-01-01T00:00:00Z"
        });
        let err = match ProposalEvent::decode(&payload.to_string()) {
            Ok(_) => panic!("decode should reject a proposal without proposal_id"),
            Err(err) => err,
        };
        assert!(matches!(err, CoreError::Decode(_)));
    }

    // Test IDs: TDEC-002
    #[test]
    fn proposal_decode_rejects_blank_identity() {
        let mut event = fixture_proposal("main", None);
        event.item_id = "  ".to_string();
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => panic!("fixture should serialize: {err}"),
        };
        let err = match ProposalEvent::decode(&payload) {
            Ok(_) => panic!("decode should reject a blank item_id"),
            Err(err) => err,
        };
        assert_eq!(err, CoreError::Validation("item_id MUST be provided".to_string()));
    }

    // Test IDs: TDEC-003
    #[test]
    fn delta_decode_requires_content_for_upserts() {
        let payload = serde_json::json!({
            "type": "im.upsert.v1",
            "ns": "acme",
            "item_id": "api.auth",
            "base_version": 0,
            "new_version": 1,
            "input_event_id": "abc-api.auth",
            "policy_version": "promoter-1.0.0",
            "source": {"repo": "r", "ref": "main", "path": "p", "blob_sha": "s"},
            "occurred_at": "2026-01-01T00:00:00Z",
            "emitted_at": "2026-01-01T00:00:00Z"
        });
        let err = match DeltaEvent::decode(&payload.to_string()) {
            Ok(_) => panic!("decode should reject an upsert delta without content"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("title and content"));
    }

    // Test IDs: TDLT-001
    #[test]
    fn delta_message_identity_is_deterministic() {
        let delta = DeltaEvent {
            delta_type: DeltaType::Retract,
            ns: "acme".to_string(),
            item_id: "api.auth".to_string(),
            base_version: 2,
            new_version: 3,
            title: None,
            content: None,
            labels: None,
            input_event_id: "abc-api.auth".to_string(),
            input_hash: None,
            policy_version: "promoter-1.0.0".to_string(),
            source: fixture_source("main"),
            occurred_at: fixture_time(),
            emitted_at: fixture_time(),
        };
        assert_eq!(delta.message_id(), "delta:acme:api.auth:v3:im.retract.v1");
        assert_eq!(delta.subject(), "delta.acme.im.retract.v1");
    }

    // Test IDs: TDLT-002
    #[test]
    fn delta_round_trips_through_wire_json() {
        let delta = DeltaEvent {
            delta_type: DeltaType::Upsert,
            ns: "acme".to_string(),
            item_id: "api.auth".to_string(),
            base_version: 0,
            new_version: 1,
            title: Some("Auth".to_string()),
            content: Some("Use OAuth2.".to_string()),
            labels: Some(BTreeSet::new()),
            input_event_id: "abc-api.auth".to_string(),
            input_hash: Some(content_hash("api.auth", "Auth", "Use OAuth2.")),
            policy_version: "promoter-1.0.0".to_string(),
            source: fixture_source("main"),
            occurred_at: fixture_time(),
            emitted_at: fixture_time(),
        };
        let json = match serde_json::to_string(&delta) {
            Ok(json) => json,
            Err(err) => panic!("delta should serialize: {err}"),
        };
        assert!(json.contains("\"type\":\"im.upsert.v1\""));
        let decoded = match DeltaEvent::decode(&json) {
            Ok(decoded) => decoded,
            Err(err) => panic!("delta should decode: {err}"),
        };
        assert_eq!(decoded, delta);
    }

    // Test IDs: TADM-001
    #[test]
    fn admin_decode_defaults_bypass_review() {
        let payload = serde_json::json!({
            "ns": "acme",
            "item_id": "api.auth",
            "action": "delete",
            "admin_metadata": {"user_id": "ops", "reason": "cleanup"},
            "source": {"repo": "admin.override", "ref": "manual", "path": "", "blob_sha": ""},
            "occurred_at": "2026-01-01T00:00:00Z",
            "event_id": "01HZY9D4Q3SG7PV9A6EXJ8N2E4"
        });
        let event = match AdminEvent::decode(&payload.to_string()) {
            Ok(event) => event,
            Err(err) => panic!("admin event should decode: {err}"),
        };
        assert!(event.admin_metadata.bypass_review);
        assert_eq!(event.admin_metadata.expected_version, None);
        assert_eq!(event.event_key(), "01HZY9D4Q3SG7PV9A6EXJ8N2E4-api.auth");
    }

    // Test IDs: TSUB-001
    #[test]
    fn subjects_follow_the_routing_contract() {
        assert_eq!(proposal_subject("acme", "api.auth"), "proposal.acme.api.auth");
        assert_eq!(
            admin_subject(AdminAction::Delete, "acme", "api.auth"),
            "admin.delete.acme.api.auth"
        );
        assert_eq!(audit_subject("acme"), "audit.acme.promoter.decision.v1");
        assert!(is_admin_subject("admin.update.acme.api.auth"));
        assert!(!is_admin_subject("proposal.acme.api.auth"));
    }

    // Test IDs: TREF-001
    #[test]
    fn main_ref_detection_is_case_insensitive_and_suffix_aware() {
        for git_ref in ["main", "MASTER", "refs/heads/main", "refs/heads/Master"] {
            let event = fixture_proposal(git_ref, None);
            assert_eq!(evaluate_policy(&event).kind, DecisionKind::Promote, "ref={git_ref}");
        }
        for git_ref in ["develop", "refs/heads/mainline", "domain"] {
            let event = fixture_proposal(git_ref, None);
            assert_eq!(evaluate_policy(&event).kind, DecisionKind::Skip, "ref={git_ref}");
        }
    }
}
