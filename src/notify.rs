use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::rules::{Finding, FindingKind, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Both,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Both => "both",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "both" => Some(Channel::Both),
            _ => None,
        }
    }
}

/// Guardian contact record as returned by the contact directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianContact {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub preferred_channel: Option<Channel>,
    pub enabled: bool,
}

/// Communication configuration applied by the policy and dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommsConfig {
    /// Global switch: nothing notifies while this is off.
    pub alert_notifications: bool,
    pub notify_critical: bool,
    pub notify_high: bool,
    /// Absence count at which a critical-attendance finding notifies
    /// even when priority-based rules decline.
    pub attendance_threshold: usize,
    /// Average below which a performance finding notifies even when
    /// priority-based rules decline.
    pub performance_threshold: f64,
    /// Local-time send window, both ends inclusive, as HH:MM.
    pub send_window_start: String,
    pub send_window_end: String,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            alert_notifications: true,
            notify_critical: true,
            notify_high: true,
            attendance_threshold: 5,
            performance_threshold: 5.0,
            send_window_start: "08:00".to_string(),
            send_window_end: "20:00".to_string(),
        }
    }
}

/// Rendered notification content.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    pub title: String,
    pub body: String,
}

/// Decides whether a finding should reach the guardian at all.
pub fn should_notify(finding: &Finding, config: &CommsConfig) -> bool {
    if !config.alert_notifications {
        return false;
    }
    let by_priority = (finding.priority == Priority::Critical && config.notify_critical)
        || (finding.priority == Priority::High && config.notify_high);
    let by_attendance = finding.kind == FindingKind::CriticalAttendance
        && finding.supporting_metrics.absences >= config.attendance_threshold;
    let by_performance = finding.kind.involves_performance()
        && finding.supporting_metrics.current_average < config.performance_threshold;
    by_priority || by_attendance || by_performance
}

/// Picks the delivery channel for a contact: explicit preference first
/// (when the matching address exists), both when both addresses exist,
/// otherwise whichever single channel is available, defaulting to
/// email.
pub fn pick_channel(contact: &GuardianContact) -> Channel {
    let has_email = contact.email.as_deref().is_some_and(|e| !e.is_empty());
    let has_phone = contact.phone.as_deref().is_some_and(|p| !p.is_empty());

    match contact.preferred_channel {
        Some(Channel::Email) if has_email => return Channel::Email,
        Some(Channel::Sms) if has_phone => return Channel::Sms,
        Some(Channel::Both) if has_email && has_phone => return Channel::Both,
        _ => {}
    }

    if has_email && has_phone {
        Channel::Both
    } else if has_phone {
        Channel::Sms
    } else {
        Channel::Email
    }
}

fn title_for(kind: FindingKind) -> &'static str {
    match kind {
        FindingKind::CriticalPerformance => "Alerta crítica de rendimiento",
        FindingKind::LowPerformance => "Alerta de rendimiento",
        FindingKind::CriticalAttendance => "Alerta crítica de asistencia",
        FindingKind::LowAttendance => "Alerta de asistencia",
        FindingKind::NegativeTrend => "Tendencia negativa",
        FindingKind::PositiveTrend => "Tendencia positiva",
        FindingKind::SubjectsAtRisk => "Materias en riesgo",
        FindingKind::Neutral => "Observación de seguimiento",
    }
}

/// Renders the guardian-facing message for a finding.
pub fn render(finding: &Finding) -> MessageContent {
    let metrics = &finding.supporting_metrics;
    let mut body = finding.message.clone();
    body.push_str(&format!(
        " Promedio actual: {:.1}. Asistencia: {:.0}%.",
        metrics.current_average, metrics.attendance_rate
    ));
    if let Some(previous) = metrics.previous_average {
        body.push_str(&format!(" Promedio anterior: {:.1}.", previous));
    }
    MessageContent {
        title: title_for(finding.kind).to_string(),
        body,
    }
}

fn parse_hhmm(raw: &str) -> Option<u32> {
    let (h, m) = raw.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 100 + minute)
}

const DEFAULT_WINDOW_START: u32 = 800;
const DEFAULT_WINDOW_END: u32 = 2000;

/// Send-window gate, evaluated once at dispatch time. Times compare as
/// `hour * 100 + minute`; both window ends are inclusive. Malformed
/// configuration degrades to the default 08:00–20:00 window.
pub fn within_send_window(now: NaiveTime, config: &CommsConfig) -> bool {
    use chrono::Timelike;
    let start = parse_hhmm(&config.send_window_start).unwrap_or(DEFAULT_WINDOW_START);
    let end = parse_hhmm(&config.send_window_end).unwrap_or(DEFAULT_WINDOW_END);
    let current = now.hour() * 100 + now.minute();
    current >= start && current <= end
}
