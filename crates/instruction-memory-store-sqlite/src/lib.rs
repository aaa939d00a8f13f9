pub mod log;
pub mod projection;
pub mod promoter;

pub use log::{LogMessage, MessageLog, PublishAck};
pub use projection::{CurrentItem, ProjectionStore, StateSnapshot};
pub use promoter::{PriorItem, PromoterStore, PromotionRecord};

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use time::OffsetDateTime;

pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
    configure(&conn)?;
    Ok(conn)
}

pub(crate) fn open_in_memory_connection() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
