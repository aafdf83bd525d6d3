use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, NaiveDateTime};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::{self, NotificationRecord, NotificationState};
use crate::notify::{self, Channel, CommsConfig, GuardianContact};
use crate::rules::Finding;

/// Email channel adapter. Implementations are remote calls and should
/// enforce a bounded timeout of their own; a timeout surfaces as an
/// error and counts as a failed attempt.
pub trait EmailSender: Send + Sync {
    fn send_email(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// SMS channel adapter; same delivery contract as [`EmailSender`].
pub trait SmsSender: Send + Sync {
    fn send_sms(&self, to: &str, body: &str) -> anyhow::Result<()>;
}

/// Guardian contact directory, keyed by student id.
pub trait ContactDirectory: Send + Sync {
    fn contact_for(&self, student_id: &str) -> Option<GuardianContact>;
}

/// Typed failure for dispatcher operations.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchError {
    pub code: String,
    pub message: String,
}

impl DispatchError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DispatchError {}

/// Attempt cap: a record that has failed this many times is terminal.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    NoContact,
    ContactDisabled,
    PolicyDeclined,
}

/// What happened to a finding handed to [`Dispatcher::dispatch`].
/// `OutsideWindow` means suppressed by the send-window gate: no record
/// was created and the caller decides whether to skip or defer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchOutcome {
    Delivered { record_id: String },
    Retrying { record_id: String, attempts: u32 },
    Exhausted { record_id: String, attempts: u32 },
    Skipped { reason: SkipReason },
    OutsideWindow,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub examined: usize,
    pub delivered: usize,
    pub still_pending: usize,
    pub exhausted: usize,
    pub outside_window: bool,
}

fn stamp(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Returns true when a periodic sweep is due, per the
/// `frecuenciaRevisionAlertas` setting (hours between sweeps).
pub fn sweep_due(
    last_sweep: Option<NaiveDateTime>,
    now: NaiveDateTime,
    frequency_hours: i64,
) -> bool {
    match last_sweep {
        None => true,
        Some(last) => now - last >= Duration::hours(frequency_hours.max(1)),
    }
}

/// Applies [`crate::notify`] policy to findings, persists a
/// notification record per accepted finding, and drives delivery
/// through the channel adapters with bounded retry.
///
/// Attempts for distinct records may run concurrently; attempts for the
/// same record are serialized through an in-flight set so `attempts`
/// and state transitions stay race-free.
pub struct Dispatcher {
    conn: Mutex<Connection>,
    email: Arc<dyn EmailSender>,
    sms: Arc<dyn SmsSender>,
    contacts: Arc<dyn ContactDirectory>,
    comms: CommsConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(
        conn: Connection,
        email: Arc<dyn EmailSender>,
        sms: Arc<dyn SmsSender>,
        contacts: Arc<dyn ContactDirectory>,
        comms: CommsConfig,
    ) -> Self {
        Self {
            conn: Mutex::new(conn),
            email,
            sms,
            contacts,
            comms,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Applies policy to a fresh finding and, when accepted, persists a
    /// pending record and runs its first delivery attempt.
    pub fn dispatch(
        &self,
        finding: &Finding,
        now: NaiveDateTime,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Some(contact) = self.contacts.contact_for(&finding.student_id) else {
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::NoContact,
            });
        };
        if !contact.enabled {
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::ContactDisabled,
            });
        }
        if !notify::should_notify(finding, &self.comms) {
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::PolicyDeclined,
            });
        }
        if !notify::within_send_window(now.time(), &self.comms) {
            return Ok(DispatchOutcome::OutsideWindow);
        }

        let channel = notify::pick_channel(&contact);
        let content = notify::render(finding);
        let record = NotificationRecord::pending(finding, channel, &content, &stamp(now));
        db::insert_notification(&self.lock_conn(), &record)
            .map_err(|e| DispatchError::new("db_insert_failed", e.to_string()))?;
        tracing::debug!(record_id = %record.id, student_id = %record.student_id, "notification queued");

        self.attempt(record, &contact, now)
    }

    /// Re-attempts every pending record under the attempt cap. The only
    /// path that advances a record after its first attempt. Records in
    /// flight elsewhere are left alone; outside the send window the
    /// sweep does nothing and consumes no attempts.
    pub fn run_sweep(&self, now: NaiveDateTime) -> Result<SweepSummary, DispatchError> {
        let mut summary = SweepSummary::default();
        if !notify::within_send_window(now.time(), &self.comms) {
            summary.outside_window = true;
            return Ok(summary);
        }

        let retryable = db::list_retryable(&self.lock_conn(), MAX_ATTEMPTS)
            .map_err(|e| DispatchError::new("db_query_failed", e.to_string()))?;
        summary.examined = retryable.len();

        for record in retryable {
            let outcome = match self.contacts.contact_for(&record.student_id) {
                Some(contact) if contact.enabled => self.attempt(record, &contact, now)?,
                // A vanished or disabled contact is a failed attempt:
                // the record must still terminate at the cap.
                _ => self.record_failure(record, "contacto no disponible")?,
            };
            match outcome {
                DispatchOutcome::Delivered { .. } => summary.delivered += 1,
                DispatchOutcome::Retrying { .. } => summary.still_pending += 1,
                DispatchOutcome::Exhausted { .. } => summary.exhausted += 1,
                DispatchOutcome::Skipped { .. } | DispatchOutcome::OutsideWindow => {}
            }
        }
        Ok(summary)
    }

    pub fn record(&self, id: &str) -> Result<Option<NotificationRecord>, DispatchError> {
        db::get_notification(&self.lock_conn(), id)
            .map_err(|e| DispatchError::new("db_query_failed", e.to_string()))
    }

    pub fn records_for_student(
        &self,
        student_id: &str,
    ) -> Result<Vec<NotificationRecord>, DispatchError> {
        db::list_for_student(&self.lock_conn(), student_id)
            .map_err(|e| DispatchError::new("db_query_failed", e.to_string()))
    }

    fn attempt(
        &self,
        record: NotificationRecord,
        contact: &GuardianContact,
        now: NaiveDateTime,
    ) -> Result<DispatchOutcome, DispatchError> {
        {
            let mut in_flight = self.lock_in_flight();
            if !in_flight.insert(record.id.clone()) {
                // Another thread is mid-attempt on this record.
                return Ok(DispatchOutcome::Retrying {
                    record_id: record.id.clone(),
                    attempts: record.attempts,
                });
            }
        }

        let id = record.id.clone();
        let outcome = self.attempt_holding_slot(record, contact, now);
        self.lock_in_flight().remove(&id);
        outcome
    }

    fn attempt_holding_slot(
        &self,
        record: NotificationRecord,
        contact: &GuardianContact,
        now: NaiveDateTime,
    ) -> Result<DispatchOutcome, DispatchError> {
        // Re-read the row: a concurrent sweep may have advanced it
        // between our listing and taking the in-flight slot.
        let current = db::get_notification(&self.lock_conn(), &record.id)
            .map_err(|e| DispatchError::new("db_query_failed", e.to_string()))?
            .unwrap_or(record);
        match current.state {
            NotificationState::Sent => {
                return Ok(DispatchOutcome::Delivered {
                    record_id: current.id,
                })
            }
            NotificationState::Error => {
                return Ok(DispatchOutcome::Exhausted {
                    record_id: current.id.clone(),
                    attempts: current.attempts,
                })
            }
            NotificationState::Pending => {}
        }

        match self.deliver(&current, contact) {
            Ok(()) => {
                let attempts = current.attempts + 1;
                db::update_after_attempt(
                    &self.lock_conn(),
                    &current.id,
                    NotificationState::Sent,
                    attempts,
                    None,
                    Some(&stamp(now)),
                )
                .map_err(|e| DispatchError::new("db_update_failed", e.to_string()))?;
                Ok(DispatchOutcome::Delivered {
                    record_id: current.id,
                })
            }
            Err(error) => self.note_failed_attempt(&current, &error.to_string()),
        }
    }

    fn record_failure(
        &self,
        record: NotificationRecord,
        reason: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        {
            let mut in_flight = self.lock_in_flight();
            if !in_flight.insert(record.id.clone()) {
                return Ok(DispatchOutcome::Retrying {
                    record_id: record.id.clone(),
                    attempts: record.attempts,
                });
            }
        }
        let outcome = self.note_failed_attempt(&record, reason);
        self.lock_in_flight().remove(&record.id);
        outcome
    }

    fn note_failed_attempt(
        &self,
        record: &NotificationRecord,
        reason: &str,
    ) -> Result<DispatchOutcome, DispatchError> {
        let attempts = record.attempts + 1;
        let exhausted = attempts >= MAX_ATTEMPTS;
        let state = if exhausted {
            NotificationState::Error
        } else {
            NotificationState::Pending
        };
        tracing::warn!(
            record_id = %record.id,
            attempts,
            exhausted,
            "notification delivery failed: {}",
            reason
        );
        db::update_after_attempt(
            &self.lock_conn(),
            &record.id,
            state,
            attempts,
            Some(reason),
            None,
        )
        .map_err(|e| DispatchError::new("db_update_failed", e.to_string()))?;
        if exhausted {
            Ok(DispatchOutcome::Exhausted {
                record_id: record.id.clone(),
                attempts,
            })
        } else {
            Ok(DispatchOutcome::Retrying {
                record_id: record.id.clone(),
                attempts,
            })
        }
    }

    fn deliver(&self, record: &NotificationRecord, contact: &GuardianContact) -> anyhow::Result<()> {
        let email_to = contact.email.as_deref().filter(|e| !e.is_empty());
        let phone_to = contact.phone.as_deref().filter(|p| !p.is_empty());
        match record.channel {
            Channel::Email => {
                let to = email_to.ok_or_else(|| anyhow::anyhow!("contacto sin correo"))?;
                self.email.send_email(to, &record.title, &record.body)
            }
            Channel::Sms => {
                let to = phone_to.ok_or_else(|| anyhow::anyhow!("contacto sin teléfono"))?;
                self.sms.send_sms(to, &record.body)
            }
            Channel::Both => {
                // Both legs are attempted even if the first fails.
                let email_result = match email_to {
                    Some(to) => self.email.send_email(to, &record.title, &record.body),
                    None => Err(anyhow::anyhow!("contacto sin correo")),
                };
                let sms_result = match phone_to {
                    Some(to) => self.sms.send_sms(to, &record.body),
                    None => Err(anyhow::anyhow!("contacto sin teléfono")),
                };
                match (email_result, sms_result) {
                    (Ok(()), Ok(())) => Ok(()),
                    (Err(e), Ok(())) => Err(e.context("falló el envío de correo")),
                    (Ok(()), Err(e)) => Err(e.context("falló el envío de SMS")),
                    (Err(e1), Err(e2)) => Err(anyhow::anyhow!(
                        "falló el envío por ambos canales: {}; {}",
                        e1,
                        e2
                    )),
                }
            }
        }
    }
}
