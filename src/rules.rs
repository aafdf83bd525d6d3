use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::config::AlertThresholds;

/// One grade in a student's history. Undated grades count toward the
/// current analysis window rather than being discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub subject: String,
    pub score: f64,
    #[serde(default)]
    pub recorded_on: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    #[serde(default)]
    pub date: Option<NaiveDate>,
    pub present: bool,
}

/// Raw input to the rule engine: a student's grade and attendance
/// history as read from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSeries {
    pub student_id: String,
    #[serde(default)]
    pub grades: Vec<GradeRecord>,
    #[serde(default)]
    pub attendance: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    CriticalPerformance,
    LowPerformance,
    CriticalAttendance,
    LowAttendance,
    NegativeTrend,
    PositiveTrend,
    SubjectsAtRisk,
    Neutral,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::CriticalPerformance => "critical-performance",
            FindingKind::LowPerformance => "low-performance",
            FindingKind::CriticalAttendance => "critical-attendance",
            FindingKind::LowAttendance => "low-attendance",
            FindingKind::NegativeTrend => "negative-trend",
            FindingKind::PositiveTrend => "positive-trend",
            FindingKind::SubjectsAtRisk => "subjects-at-risk",
            FindingKind::Neutral => "neutral",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "critical-performance" => Some(FindingKind::CriticalPerformance),
            "low-performance" => Some(FindingKind::LowPerformance),
            "critical-attendance" => Some(FindingKind::CriticalAttendance),
            "low-attendance" => Some(FindingKind::LowAttendance),
            "negative-trend" => Some(FindingKind::NegativeTrend),
            "positive-trend" => Some(FindingKind::PositiveTrend),
            "subjects-at-risk" => Some(FindingKind::SubjectsAtRisk),
            "neutral" => Some(FindingKind::Neutral),
            _ => None,
        }
    }

    pub fn involves_performance(self) -> bool {
        matches!(
            self,
            FindingKind::CriticalPerformance | FindingKind::LowPerformance
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Medium => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    #[serde(rename = "mejora")]
    Mejora,
    #[serde(rename = "descenso")]
    Descenso,
    #[serde(rename = "estable")]
    Estable,
    #[serde(rename = "sin_datos")]
    SinDatos,
}

/// Metrics computed once per evaluation and shared by every rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportingMetrics {
    pub current_average: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_average: Option<f64>,
    pub absences: usize,
    pub attendance_rate: f64,
    pub trend: Trend,
    pub at_risk_subjects: Vec<String>,
}

/// A prioritized, rule-derived conclusion about a student.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub student_id: String,
    pub kind: FindingKind,
    pub priority: Priority,
    pub message: String,
    pub supporting_metrics: SupportingMetrics,
    pub generated_at: NaiveDate,
}

// Trend labels use a fixed band around zero; the configurable
// tendencia/mejora thresholds gate the trend *rules*, not the label.
const TREND_BAND: f64 = 0.5;

struct EvalContext {
    metrics: SupportingMetrics,
    current_grade_count: usize,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn compute_context(
    series: &StudentSeries,
    thresholds: &AlertThresholds,
    as_of: NaiveDate,
) -> EvalContext {
    let window_days = thresholds.dias_analisis_rendimiento.max(1);
    let current_start = as_of - Duration::days(window_days);
    let previous_start = as_of - Duration::days(2 * window_days);

    let mut current: Vec<&GradeRecord> = Vec::new();
    let mut previous_scores: Vec<f64> = Vec::new();
    for grade in &series.grades {
        match grade.recorded_on {
            None => current.push(grade),
            Some(d) if d > current_start && d <= as_of => current.push(grade),
            Some(d) if d > previous_start && d <= current_start => {
                previous_scores.push(grade.score)
            }
            Some(_) => {}
        }
    }

    let current_scores: Vec<f64> = current.iter().map(|g| g.score).collect();
    let current_average = mean(&current_scores);
    let previous_average = if previous_scores.is_empty() {
        None
    } else {
        Some(mean(&previous_scores))
    };

    let total = series.attendance.len();
    let absences = series.attendance.iter().filter(|a| !a.present).count();
    let attendance_rate = if total == 0 {
        100.0
    } else {
        100.0 * (total - absences) as f64 / total as f64
    };

    // BTreeMap keeps the at-risk list deterministically ordered.
    let mut by_subject: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for grade in &current {
        let slot = by_subject.entry(grade.subject.as_str()).or_insert((0.0, 0));
        slot.0 += grade.score;
        slot.1 += 1;
    }
    let at_risk_subjects: Vec<String> = by_subject
        .iter()
        .filter(|(_, (sum, count))| sum / (*count as f64) < thresholds.rendimiento_bajo)
        .map(|(subject, _)| subject.to_string())
        .collect();

    let trend = match previous_average {
        None => Trend::SinDatos,
        Some(prev) => {
            let diff = current_average - prev;
            if diff > TREND_BAND {
                Trend::Mejora
            } else if diff < -TREND_BAND {
                Trend::Descenso
            } else {
                Trend::Estable
            }
        }
    };

    EvalContext {
        metrics: SupportingMetrics {
            current_average,
            previous_average,
            absences,
            attendance_rate,
            trend,
            at_risk_subjects,
        },
        current_grade_count: current.len(),
    }
}

struct Rule {
    kind: FindingKind,
    priority: Priority,
    applies: fn(&EvalContext, &AlertThresholds) -> bool,
    message: fn(&EvalContext, &AlertThresholds) -> String,
}

fn critical_performance_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    ctx.current_grade_count > 0 && ctx.metrics.current_average < t.rendimiento_critico
}

fn critical_performance_message(ctx: &EvalContext, t: &AlertThresholds) -> String {
    format!(
        "Rendimiento crítico: promedio {:.1}, por debajo del umbral de {:.1}.",
        ctx.metrics.current_average, t.rendimiento_critico
    )
}

fn critical_attendance_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    ctx.metrics.attendance_rate < t.asistencia_critica
        || ctx.metrics.absences > t.max_ausencias_criticas as usize
}

fn critical_attendance_message(ctx: &EvalContext, _t: &AlertThresholds) -> String {
    format!(
        "Asistencia crítica: {:.0}% de asistencia con {} ausencias.",
        ctx.metrics.attendance_rate, ctx.metrics.absences
    )
}

fn low_performance_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    ctx.current_grade_count > 0
        && ctx.metrics.current_average >= t.rendimiento_critico
        && ctx.metrics.current_average < t.rendimiento_bajo
}

fn low_performance_message(ctx: &EvalContext, t: &AlertThresholds) -> String {
    format!(
        "Rendimiento bajo: promedio {:.1}, cerca del mínimo de {:.1}.",
        ctx.metrics.current_average, t.rendimiento_bajo
    )
}

fn low_attendance_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    let rate_low = ctx.metrics.attendance_rate >= t.asistencia_critica
        && ctx.metrics.attendance_rate < t.asistencia_baja;
    let absences_low = ctx.metrics.absences > t.max_ausencias_bajas as usize
        && ctx.metrics.absences <= t.max_ausencias_criticas as usize;
    rate_low || absences_low
}

fn low_attendance_message(ctx: &EvalContext, _t: &AlertThresholds) -> String {
    format!(
        "Asistencia baja: {:.0}% de asistencia con {} ausencias.",
        ctx.metrics.attendance_rate, ctx.metrics.absences
    )
}

fn negative_trend_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    match ctx.metrics.previous_average {
        Some(prev) => prev - ctx.metrics.current_average > t.tendencia_negativa_minima,
        None => false,
    }
}

fn negative_trend_message(ctx: &EvalContext, _t: &AlertThresholds) -> String {
    let prev = ctx.metrics.previous_average.unwrap_or(0.0);
    format!(
        "Descenso de {:.1} puntos respecto del período anterior ({:.1} a {:.1}).",
        prev - ctx.metrics.current_average,
        prev,
        ctx.metrics.current_average
    )
}

fn subjects_at_risk_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    ctx.metrics.at_risk_subjects.len() >= t.materias_en_riesgo_minimas
}

fn subjects_at_risk_message(ctx: &EvalContext, _t: &AlertThresholds) -> String {
    format!(
        "{} materias en riesgo: {}.",
        ctx.metrics.at_risk_subjects.len(),
        ctx.metrics.at_risk_subjects.join(", ")
    )
}

fn positive_trend_applies(ctx: &EvalContext, t: &AlertThresholds) -> bool {
    match ctx.metrics.previous_average {
        Some(prev) => ctx.metrics.current_average - prev > t.mejora_significativa,
        None => false,
    }
}

fn positive_trend_message(ctx: &EvalContext, _t: &AlertThresholds) -> String {
    let prev = ctx.metrics.previous_average.unwrap_or(0.0);
    format!(
        "Mejora de {:.1} puntos respecto del período anterior ({:.1} a {:.1}).",
        ctx.metrics.current_average - prev,
        prev,
        ctx.metrics.current_average
    )
}

// Canonical rule order. Also the tie-breaker when two qualifying rules
// share a priority, so it must stay stable.
static RULES: &[Rule] = &[
    Rule {
        kind: FindingKind::CriticalPerformance,
        priority: Priority::Critical,
        applies: critical_performance_applies,
        message: critical_performance_message,
    },
    Rule {
        kind: FindingKind::CriticalAttendance,
        priority: Priority::Critical,
        applies: critical_attendance_applies,
        message: critical_attendance_message,
    },
    Rule {
        kind: FindingKind::LowPerformance,
        priority: Priority::High,
        applies: low_performance_applies,
        message: low_performance_message,
    },
    Rule {
        kind: FindingKind::LowAttendance,
        priority: Priority::Medium,
        applies: low_attendance_applies,
        message: low_attendance_message,
    },
    Rule {
        kind: FindingKind::NegativeTrend,
        priority: Priority::High,
        applies: negative_trend_applies,
        message: negative_trend_message,
    },
    Rule {
        kind: FindingKind::SubjectsAtRisk,
        priority: Priority::Medium,
        applies: subjects_at_risk_applies,
        message: subjects_at_risk_message,
    },
    Rule {
        kind: FindingKind::PositiveTrend,
        priority: Priority::Low,
        applies: positive_trend_applies,
        message: positive_trend_message,
    },
];

fn neutral_finding(
    series: &StudentSeries,
    ctx: &EvalContext,
    thresholds: &AlertThresholds,
    as_of: NaiveDate,
) -> Finding {
    let message = if ctx.current_grade_count > 0
        && ctx.metrics.current_average >= thresholds.rendimiento_excelente
    {
        format!(
            "Rendimiento excelente: promedio {:.1}. ¡Felicitaciones!",
            ctx.metrics.current_average
        )
    } else {
        "Rendimiento estable, sin alertas activas.".to_string()
    };
    Finding {
        student_id: series.student_id.clone(),
        kind: FindingKind::Neutral,
        priority: Priority::Low,
        message,
        supporting_metrics: ctx.metrics.clone(),
        generated_at: as_of,
    }
}

/// Evaluates every rule against the shared metrics. Pure, deterministic
/// and total: malformed or empty input degrades to zeroed metrics, and
/// when no rule fires the result is a single neutral finding so callers
/// always have a headline to render.
///
/// `as_of` anchors the analysis windows (current period
/// `(as_of - días, as_of]`, previous period the window before it) so
/// evaluation does not depend on the wall clock.
pub fn evaluate(
    series: &StudentSeries,
    thresholds: &AlertThresholds,
    as_of: NaiveDate,
) -> Vec<Finding> {
    let ctx = compute_context(series, thresholds, as_of);

    let findings: Vec<Finding> = RULES
        .iter()
        .filter(|rule| (rule.applies)(&ctx, thresholds))
        .map(|rule| Finding {
            student_id: series.student_id.clone(),
            kind: rule.kind,
            priority: rule.priority,
            message: (rule.message)(&ctx, thresholds),
            supporting_metrics: ctx.metrics.clone(),
            generated_at: as_of,
        })
        .collect();

    if findings.is_empty() {
        vec![neutral_finding(series, &ctx, thresholds, as_of)]
    } else {
        findings
    }
}

/// Selects the single headline finding: highest priority wins, ties
/// resolve to the earliest entry in the canonical rule order (which is
/// the order `evaluate` emits).
pub fn headline(findings: &[Finding]) -> Option<&Finding> {
    let mut best: Option<&Finding> = None;
    for finding in findings {
        match best {
            Some(current) if finding.priority.rank() <= current.priority.rank() => {}
            _ => best = Some(finding),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 16).unwrap()
    }

    fn day(offset_back: i64) -> Option<NaiveDate> {
        Some(as_of() - Duration::days(offset_back))
    }

    fn grades(current: &[f64], previous: &[f64]) -> Vec<GradeRecord> {
        let mut out = Vec::new();
        for (i, score) in current.iter().enumerate() {
            out.push(GradeRecord {
                subject: format!("materia-{}", i % 3),
                score: *score,
                recorded_on: day(5),
            });
        }
        for (i, score) in previous.iter().enumerate() {
            out.push(GradeRecord {
                subject: format!("materia-{}", i % 3),
                score: *score,
                recorded_on: day(40),
            });
        }
        out
    }

    fn attendance(present: usize, absent: usize) -> Vec<AttendanceRecord> {
        let mut out = Vec::new();
        for i in 0..present {
            out.push(AttendanceRecord {
                date: day(i as i64 + 1),
                present: true,
            });
        }
        for i in 0..absent {
            out.push(AttendanceRecord {
                date: day(i as i64 + 1),
                present: false,
            });
        }
        out
    }

    fn series(grades: Vec<GradeRecord>, attendance: Vec<AttendanceRecord>) -> StudentSeries {
        StudentSeries {
            student_id: "s1".to_string(),
            grades,
            attendance,
        }
    }

    #[test]
    fn empty_series_yields_exactly_one_neutral_finding() {
        let s = series(Vec::new(), Vec::new());
        let findings = evaluate(&s, &AlertThresholds::default(), as_of());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Neutral);
        assert_eq!(findings[0].supporting_metrics.current_average, 0.0);
        assert_eq!(findings[0].supporting_metrics.attendance_rate, 100.0);
        assert_eq!(findings[0].supporting_metrics.trend, Trend::SinDatos);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let s = series(grades(&[4.0, 5.5, 7.0], &[6.0, 6.5]), attendance(10, 4));
        let a = evaluate(&s, &AlertThresholds::default(), as_of());
        let b = evaluate(&s, &AlertThresholds::default(), as_of());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.kind, y.kind);
            assert_eq!(x.message, y.message);
            assert_eq!(x.supporting_metrics, y.supporting_metrics);
        }
    }

    #[test]
    fn critical_drop_fires_both_rules_and_headline_is_critical() {
        // Current average 4.0 vs previous 6.0: drop of 2.0 crosses both
        // the critical-performance and negative-trend thresholds.
        let s = series(grades(&[4.0], &[6.0]), Vec::new());
        let findings = evaluate(&s, &AlertThresholds::default(), as_of());
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FindingKind::CriticalPerformance));
        assert!(kinds.contains(&FindingKind::NegativeTrend));
        let top = headline(&findings).expect("headline");
        assert_eq!(top.kind, FindingKind::CriticalPerformance);
        assert_eq!(top.priority, Priority::Critical);
        assert_eq!(top.supporting_metrics.trend, Trend::Descenso);
    }

    #[test]
    fn attendance_thresholds_split_critical_from_low() {
        // 6 absences out of 17 records: rate ~64.7%, absences > 5.
        let critical = series(Vec::new(), attendance(11, 6));
        let findings = evaluate(&critical, &AlertThresholds::default(), as_of());
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FindingKind::CriticalAttendance));
        assert!(!kinds.contains(&FindingKind::LowAttendance));

        // 4 absences out of 18: rate ~77.8%, inside the low band only.
        let low = series(Vec::new(), attendance(14, 4));
        let findings = evaluate(&low, &AlertThresholds::default(), as_of());
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FindingKind::LowAttendance));
        assert!(!kinds.contains(&FindingKind::CriticalAttendance));
    }

    #[test]
    fn subjects_at_risk_requires_two_weak_subjects() {
        let weak = vec![
            GradeRecord {
                subject: "matemática".into(),
                score: 4.0,
                recorded_on: day(3),
            },
            GradeRecord {
                subject: "lengua".into(),
                score: 5.0,
                recorded_on: day(4),
            },
            GradeRecord {
                subject: "historia".into(),
                score: 8.0,
                recorded_on: day(5),
            },
        ];
        let findings = evaluate(&series(weak, Vec::new()), &AlertThresholds::default(), as_of());
        let at_risk = findings
            .iter()
            .find(|f| f.kind == FindingKind::SubjectsAtRisk)
            .expect("subjects-at-risk finding");
        assert_eq!(
            at_risk.supporting_metrics.at_risk_subjects,
            vec!["lengua".to_string(), "matemática".to_string()]
        );
    }

    #[test]
    fn positive_trend_and_excellent_neutral() {
        let improving = series(grades(&[8.5], &[6.0]), Vec::new());
        let findings = evaluate(&improving, &AlertThresholds::default(), as_of());
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FindingKind::PositiveTrend));
        assert_eq!(findings[0].supporting_metrics.trend, Trend::Mejora);

        // No rule fires at a steady 9.5: the neutral observation
        // switches to the congratulatory wording.
        let excellent = series(grades(&[9.5, 9.5], &[9.4]), attendance(10, 0));
        let findings = evaluate(&excellent, &AlertThresholds::default(), as_of());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Neutral);
        assert!(findings[0].message.contains("excelente"));
    }

    #[test]
    fn undated_grades_count_toward_current_period() {
        let s = series(
            vec![GradeRecord {
                subject: "física".into(),
                score: 3.0,
                recorded_on: None,
            }],
            Vec::new(),
        );
        let findings = evaluate(&s, &AlertThresholds::default(), as_of());
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::CriticalPerformance));
    }

    #[test]
    fn grades_outside_both_windows_are_ignored() {
        let s = series(
            vec![GradeRecord {
                subject: "física".into(),
                score: 2.0,
                recorded_on: day(200),
            }],
            Vec::new(),
        );
        let findings = evaluate(&s, &AlertThresholds::default(), as_of());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::Neutral);
    }

    #[test]
    fn trend_band_keeps_small_moves_stable() {
        let s = series(grades(&[6.4], &[6.0]), Vec::new());
        let findings = evaluate(&s, &AlertThresholds::default(), as_of());
        assert_eq!(findings[0].supporting_metrics.trend, Trend::Estable);
    }

    #[test]
    fn headline_prefers_first_of_equal_priority() {
        // Low performance (high) and a negative trend (high): the
        // canonical order puts low-performance first.
        let s = series(grades(&[5.5], &[7.0]), Vec::new());
        let findings = evaluate(&s, &AlertThresholds::default(), as_of());
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&FindingKind::LowPerformance));
        assert!(kinds.contains(&FindingKind::NegativeTrend));
        let top = headline(&findings).expect("headline");
        assert_eq!(top.kind, FindingKind::LowPerformance);
    }

    #[test]
    fn overridden_thresholds_change_rule_outcomes() {
        let mut thresholds = AlertThresholds::default();
        thresholds.rendimiento_critico = 7.0;
        let s = series(grades(&[6.5], &[]), Vec::new());
        let findings = evaluate(&s, &thresholds, as_of());
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::CriticalPerformance));
    }
}
