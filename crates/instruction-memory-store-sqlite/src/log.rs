use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{now_rfc3339, open_connection, open_in_memory_connection};

const LOG_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS log_messages (
  stream       TEXT NOT NULL,
  seq          INTEGER NOT NULL,
  subject      TEXT NOT NULL,
  msg_id       TEXT,
  payload      TEXT NOT NULL,
  published_at TEXT NOT NULL,
  PRIMARY KEY (stream, seq)
);

CREATE UNIQUE INDEX IF NOT EXISTS ux_log_messages_msg_id
  ON log_messages(stream, msg_id) WHERE msg_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS log_consumers (
  stream    TEXT NOT NULL,
  durable   TEXT NOT NULL,
  filter    TEXT NOT NULL,
  ack_floor INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (stream, durable)
);
";

/// One stored message of an ordered, at-least-once stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub stream: String,
    pub seq: i64,
    pub subject: String,
    pub msg_id: Option<String>,
    pub payload: String,
    pub published_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub seq: i64,
    pub duplicate: bool,
}

/// Durable, ordered message log over SQLite. Streams assign gapless
/// per-stream sequence numbers; publishes carrying a message identity are
/// deduplicated by the log itself, independent of any application ledger.
pub struct MessageLog {
    conn: Connection,
}

impl MessageLog {
    /// Open (or create) a message log database.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(LOG_SCHEMA_SQL).context("failed to apply message log schema")?;
        Ok(Self { conn })
    }

    /// Open a private in-memory log, used by tests.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = open_in_memory_connection()?;
        conn.execute_batch(LOG_SCHEMA_SQL).context("failed to apply message log schema")?;
        Ok(Self { conn })
    }

    /// Append one message to a stream. When `msg_id` matches an already
    /// stored message of the same stream, nothing is appended and the ack
    /// reports the original sequence with `duplicate = true`.
    ///
    /// # Errors
    /// Returns an error when the append transaction fails.
    pub fn publish(
        &mut self,
        stream: &str,
        subject: &str,
        msg_id: Option<&str>,
        payload: &str,
    ) -> Result<PublishAck> {
        let tx = self.conn.transaction().context("failed to start publish transaction")?;

        if let Some(id) = msg_id {
            let existing = tx
                .query_row(
                    "SELECT seq FROM log_messages WHERE stream = ?1 AND msg_id = ?2",
                    params![stream, id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .context("failed to check publish identity")?;
            if let Some(seq) = existing {
                tx.commit().context("failed to commit publish transaction")?;
                return Ok(PublishAck { stream: stream.to_string(), seq, duplicate: true });
            }
        }

        let seq: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM log_messages WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )
            .context("failed to assign stream sequence")?;

        tx.execute(
            "INSERT INTO log_messages(stream, seq, subject, msg_id, payload, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![stream, seq, subject, msg_id, payload, now_rfc3339()?],
        )
        .context("failed to append log message")?;

        tx.commit().context("failed to commit publish transaction")?;
        Ok(PublishAck { stream: stream.to_string(), seq, duplicate: false })
    }

    /// Register a durable consumer; repeated registration keeps its position.
    ///
    /// # Errors
    /// Returns an error when the consumer row cannot be written.
    pub fn create_durable(&self, stream: &str, durable: &str, filter: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO log_consumers(stream, durable, filter, ack_floor)
                 VALUES (?1, ?2, ?3, 0)",
                params![stream, durable, filter],
            )
            .context("failed to register durable consumer")?;
        Ok(())
    }

    /// Fetch the next unacknowledged message matching the consumer's filter.
    /// Delivery is strictly sequential: the same message is returned again
    /// until it is acknowledged (at-least-once).
    ///
    /// # Errors
    /// Returns an error when the consumer is unknown or reads fail.
    pub fn fetch_next(&self, stream: &str, durable: &str) -> Result<Option<LogMessage>> {
        let (filter, ack_floor) = self.consumer_state(stream, durable)?;

        let mut stmt = self.conn.prepare(
            "SELECT stream, seq, subject, msg_id, payload, published_at
             FROM log_messages
             WHERE stream = ?1 AND seq > ?2
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![stream, ack_floor])?;

        while let Some(row) = rows.next()? {
            let message = LogMessage {
                stream: row.get(0)?,
                seq: row.get(1)?,
                subject: row.get(2)?,
                msg_id: row.get(3)?,
                payload: row.get(4)?,
                published_at: row.get(5)?,
            };
            if subject_matches(&filter, &message.subject) {
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    /// Acknowledge a delivered message, advancing the consumer floor. A
    /// negative acknowledgment is simply the absence of this call: the
    /// message is redelivered by the next fetch.
    ///
    /// # Errors
    /// Returns an error when the floor update fails.
    pub fn ack(&mut self, stream: &str, durable: &str, seq: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE log_consumers SET ack_floor = ?3
                 WHERE stream = ?1 AND durable = ?2 AND ack_floor < ?3",
                params![stream, durable, seq],
            )
            .context("failed to acknowledge message")?;
        Ok(())
    }

    /// Position-less read of a whole stream from sequence 1, used by replay.
    /// No consumer state is created or consulted; concurrent readers cannot
    /// interfere with each other or with durable consumers.
    ///
    /// # Errors
    /// Returns an error when reads fail.
    pub fn read_from_start(
        &self,
        stream: &str,
        filter: &str,
        max_sequence: Option<i64>,
    ) -> Result<Vec<LogMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT stream, seq, subject, msg_id, payload, published_at
             FROM log_messages
             WHERE stream = ?1 AND seq <= ?2
             ORDER BY seq ASC",
        )?;
        let mut rows = stmt.query(params![stream, max_sequence.unwrap_or(i64::MAX)])?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            let message = LogMessage {
                stream: row.get(0)?,
                seq: row.get(1)?,
                subject: row.get(2)?,
                msg_id: row.get(3)?,
                payload: row.get(4)?,
                published_at: row.get(5)?,
            };
            if subject_matches(filter, &message.subject) {
                messages.push(message);
            }
        }

        Ok(messages)
    }

    /// Highest assigned sequence of a stream (0 when empty).
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn last_sequence(&self, stream: &str) -> Result<i64> {
        let seq = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM log_messages WHERE stream = ?1",
                params![stream],
                |row| row.get(0),
            )
            .context("failed to read stream sequence")?;
        Ok(seq)
    }

    fn consumer_state(&self, stream: &str, durable: &str) -> Result<(String, i64)> {
        self.conn
            .query_row(
                "SELECT filter, ack_floor FROM log_consumers WHERE stream = ?1 AND durable = ?2",
                params![stream, durable],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read consumer state")?
            .ok_or_else(|| anyhow!("unknown durable consumer {durable} on stream {stream}"))
    }
}

/// Token-wise subject match with NATS-style wildcards: `*` matches one
/// token, a trailing `>` matches the rest of the subject.
#[must_use]
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');

    for filter_token in filter.split('.') {
        if filter_token == ">" {
            return true;
        }
        match subject_tokens.next() {
            Some(token) if filter_token == "*" || filter_token == token => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_log() -> MessageLog {
        match MessageLog::open_in_memory() {
            Ok(log) => log,
            Err(err) => panic!("log should open: {err}"),
        }
    }

    fn publish(log: &mut MessageLog, subject: &str, msg_id: Option<&str>) -> PublishAck {
        match log.publish("DELTAS", subject, msg_id, "{}") {
            Ok(ack) => ack,
            Err(err) => panic!("publish should succeed: {err}"),
        }
    }

    // Test IDs: TLOG-001
    #[test]
    fn sequences_are_gapless_and_per_stream() {
        let mut log = open_log();
        assert_eq!(publish(&mut log, "delta.acme.im.upsert.v1", None).seq, 1);
        assert_eq!(publish(&mut log, "delta.acme.im.upsert.v1", None).seq, 2);

        let other = match log.publish("EVENTS", "proposal.acme.api.auth", None, "{}") {
            Ok(ack) => ack,
            Err(err) => panic!("publish should succeed: {err}"),
        };
        assert_eq!(other.seq, 1);
    }

    // Test IDs: TLOG-002
    #[test]
    fn publish_identity_deduplicates_retried_publishes() {
        let mut log = open_log();
        let first = publish(&mut log, "delta.acme.im.upsert.v1", Some("delta:acme:a:v1:u"));
        let retry = publish(&mut log, "delta.acme.im.upsert.v1", Some("delta:acme:a:v1:u"));

        assert!(!first.duplicate);
        assert!(retry.duplicate);
        assert_eq!(retry.seq, first.seq);
        match log.last_sequence("DELTAS") {
            Ok(seq) => assert_eq!(seq, 1),
            Err(err) => panic!("last_sequence should succeed: {err}"),
        }
    }

    // Test IDs: TLOG-003
    #[test]
    fn unacked_messages_are_redelivered_in_order() {
        let mut log = open_log();
        publish(&mut log, "delta.acme.im.upsert.v1", None);
        publish(&mut log, "delta.acme.im.retract.v1", None);
        if let Err(err) = log.create_durable("DELTAS", "projector", "delta.>") {
            panic!("create_durable should succeed: {err}");
        }

        let first = match log.fetch_next("DELTAS", "projector") {
            Ok(Some(message)) => message,
            Ok(None) => panic!("a message should be available"),
            Err(err) => panic!("fetch should succeed: {err}"),
        };
        assert_eq!(first.seq, 1);

        // Not acknowledged: the same message comes back.
        let again = match log.fetch_next("DELTAS", "projector") {
            Ok(Some(message)) => message,
            Ok(None) => panic!("a message should be available"),
            Err(err) => panic!("fetch should succeed: {err}"),
        };
        assert_eq!(again.seq, 1);

        if let Err(err) = log.ack("DELTAS", "projector", 1) {
            panic!("ack should succeed: {err}");
        }
        let second = match log.fetch_next("DELTAS", "projector") {
            Ok(Some(message)) => message,
            Ok(None) => panic!("a message should be available"),
            Err(err) => panic!("fetch should succeed: {err}"),
        };
        assert_eq!(second.seq, 2);
        assert_eq!(second.subject, "delta.acme.im.retract.v1");
    }

    // Test IDs: TLOG-004
    #[test]
    fn consumer_filter_skips_unrelated_subjects() {
        let mut log = open_log();
        publish(&mut log, "delta.other.im.upsert.v1", None);
        publish(&mut log, "delta.acme.im.upsert.v1", None);
        if let Err(err) = log.create_durable("DELTAS", "acme-only", "delta.acme.>") {
            panic!("create_durable should succeed: {err}");
        }

        let message = match log.fetch_next("DELTAS", "acme-only") {
            Ok(Some(message)) => message,
            Ok(None) => panic!("a message should be available"),
            Err(err) => panic!("fetch should succeed: {err}"),
        };
        assert_eq!(message.seq, 2);
    }

    // Test IDs: TLOG-005
    #[test]
    fn ephemeral_read_always_starts_at_the_beginning() {
        let mut log = open_log();
        publish(&mut log, "delta.acme.im.upsert.v1", None);
        publish(&mut log, "delta.acme.im.upsert.v1", None);
        publish(&mut log, "delta.other.im.upsert.v1", None);

        for _ in 0..2 {
            let messages = match log.read_from_start("DELTAS", "delta.acme.>", None) {
                Ok(messages) => messages,
                Err(err) => panic!("read should succeed: {err}"),
            };
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].seq, 1);
        }

        let capped = match log.read_from_start("DELTAS", "delta.acme.>", Some(1)) {
            Ok(messages) => messages,
            Err(err) => panic!("read should succeed: {err}"),
        };
        assert_eq!(capped.len(), 1);
    }

    // Test IDs: TLOG-006
    #[test]
    fn subject_wildcards_match_token_wise() {
        assert!(subject_matches(">", "anything.at.all"));
        assert!(subject_matches("delta.>", "delta.acme.im.upsert.v1"));
        assert!(subject_matches("delta.*.im.upsert.v1", "delta.acme.im.upsert.v1"));
        assert!(subject_matches("proposal.acme.api.auth", "proposal.acme.api.auth"));
        assert!(!subject_matches("delta.acme.>", "delta.other.im.upsert.v1"));
        assert!(!subject_matches("delta.acme", "delta.acme.im.upsert.v1"));
        assert!(!subject_matches("delta.acme.im.upsert.v1", "delta.acme"));
    }
}
