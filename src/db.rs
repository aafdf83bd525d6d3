use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::{Channel, MessageContent};
use crate::rules::{Finding, FindingKind, Priority};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("aulacore.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            kind TEXT,
            channel TEXT NOT NULL,
            priority TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            sent_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_state ON notifications(state)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_student ON notifications(student_id)",
        [],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    Pending,
    Sent,
    Error,
}

impl NotificationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationState::Pending => "pending",
            NotificationState::Sent => "sent",
            NotificationState::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(NotificationState::Pending),
            "sent" => Some(NotificationState::Sent),
            "error" => Some(NotificationState::Error),
            _ => None,
        }
    }
}

/// One guardian notification and its delivery bookkeeping. `attempts`
/// counts executed attempts; `pending` records with `attempts` below
/// the cap are the retry sweep's work list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub student_id: String,
    pub kind: Option<FindingKind>,
    pub channel: Channel,
    pub priority: Priority,
    pub title: String,
    pub body: String,
    pub state: NotificationState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub sent_at: Option<String>,
}

impl NotificationRecord {
    pub fn pending(
        finding: &Finding,
        channel: Channel,
        content: &MessageContent,
        created_at: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            student_id: finding.student_id.clone(),
            kind: Some(finding.kind),
            channel,
            priority: finding.priority,
            title: content.title.clone(),
            body: content.body.clone(),
            state: NotificationState::Pending,
            attempts: 0,
            last_error: None,
            created_at: created_at.to_string(),
            sent_at: None,
        }
    }
}

fn conversion_failure(what: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unrecognized {} value: {}", what, raw).into(),
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<NotificationRecord> {
    let kind: Option<String> = row.get(2)?;
    let channel: String = row.get(3)?;
    let priority: String = row.get(4)?;
    let state: String = row.get(7)?;
    Ok(NotificationRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        kind: kind.as_deref().and_then(FindingKind::parse),
        channel: Channel::parse(&channel).ok_or_else(|| conversion_failure("channel", &channel))?,
        priority: Priority::parse(&priority)
            .ok_or_else(|| conversion_failure("priority", &priority))?,
        title: row.get(5)?,
        body: row.get(6)?,
        state: NotificationState::parse(&state)
            .ok_or_else(|| conversion_failure("state", &state))?,
        attempts: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        sent_at: row.get(11)?,
    })
}

const RECORD_COLUMNS: &str = "id, student_id, kind, channel, priority, title, body, state,
       attempts, last_error, created_at, sent_at";

pub fn insert_notification(conn: &Connection, record: &NotificationRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO notifications(
            id, student_id, kind, channel, priority, title, body, state,
            attempts, last_error, created_at, sent_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            record.id,
            record.student_id,
            record.kind.map(FindingKind::as_str),
            record.channel.as_str(),
            record.priority.as_str(),
            record.title,
            record.body,
            record.state.as_str(),
            record.attempts,
            record.last_error,
            record.created_at,
            record.sent_at,
        ],
    )?;
    Ok(())
}

pub fn update_after_attempt(
    conn: &Connection,
    id: &str,
    state: NotificationState,
    attempts: u32,
    last_error: Option<&str>,
    sent_at: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE notifications
         SET state = ?, attempts = ?, last_error = ?, sent_at = ?
         WHERE id = ?",
        rusqlite::params![state.as_str(), attempts, last_error, sent_at, id],
    )?;
    Ok(())
}

/// Pending records still under the attempt cap, oldest first: the
/// retry sweep's work list. Exhausted (`error`) records never appear.
pub fn list_retryable(
    conn: &Connection,
    max_attempts: u32,
) -> anyhow::Result<Vec<NotificationRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS}
         FROM notifications
         WHERE state = 'pending' AND attempts < ?
         ORDER BY created_at, id"
    ))?;
    let records = stmt
        .query_map([max_attempts], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn get_notification(conn: &Connection, id: &str) -> anyhow::Result<Option<NotificationRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM notifications WHERE id = ?"),
            [id],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

pub fn list_for_student(
    conn: &Connection,
    student_id: &str,
) -> anyhow::Result<Vec<NotificationRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS}
         FROM notifications
         WHERE student_id = ?
         ORDER BY created_at DESC, id"
    ))?;
    let records = stmt
        .query_map([student_id], row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}
