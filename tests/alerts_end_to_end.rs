
use aulacore::config::AlertThresholds;
use aulacore::db;
use aulacore::dispatch::{DispatchOutcome, Dispatcher};
use aulacore::notify::CommsConfig;
use aulacore::rules::{self, AttendanceRecord, FindingKind, GradeRecord, StudentSeries};
use chrono::{Duration, NaiveDate};
use test_support::{at, email_contact, ScriptedEmail, ScriptedSms, StaticContacts};

fn sliding_series(as_of: NaiveDate) -> StudentSeries {
    let current = as_of - Duration::days(4);
    let previous = as_of - Duration::days(40);
    StudentSeries {
        student_id: "s1".to_string(),
        grades: vec![
            GradeRecord {
                subject: "matemática".into(),
                score: 3.5,
                recorded_on: Some(current),
            },
            GradeRecord {
                subject: "lengua".into(),
                score: 4.5,
                recorded_on: Some(current),
            },
            GradeRecord {
                subject: "matemática".into(),
                score: 6.0,
                recorded_on: Some(previous),
            },
            GradeRecord {
                subject: "lengua".into(),
                score: 6.0,
                recorded_on: Some(previous),
            },
        ],
        attendance: vec![
            AttendanceRecord {
                date: Some(current),
                present: true,
            },
            AttendanceRecord {
                date: Some(current),
                present: false,
            },
        ],
    }
}

#[test]
fn evaluated_headline_flows_through_dispatch_to_the_guardian() {
    let as_of = NaiveDate::from_ymd_opt(2026, 3, 16).unwrap();
    let thresholds = AlertThresholds::default();
    let findings = rules::evaluate(&sliding_series(as_of), &thresholds, as_of);

    // Average dropped from 6.0 to 4.0: both the critical-performance
    // and negative-trend rules fire; the headline is the critical one.
    let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
    assert!(kinds.contains(&FindingKind::CriticalPerformance));
    assert!(kinds.contains(&FindingKind::NegativeTrend));
    let top = rules::headline(&findings).expect("headline");
    assert_eq!(top.kind, FindingKind::CriticalPerformance);

    let email = ScriptedEmail::new(0);
    let sms = ScriptedSms::new(0);
    let contacts = StaticContacts::new(vec![("s1", email_contact("tutor@example.com"))]);
    let dispatcher = Dispatcher::new(
        db::open_memory().expect("open db"),
        email.clone(),
        sms,
        contacts,
        CommsConfig::default(),
    );

    let outcome = dispatcher.dispatch(top, at(9, 0)).expect("dispatch");
    assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));

    let sent = email.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let (to, subject, body) = &sent[0];
    assert_eq!(to, "tutor@example.com");
    assert_eq!(subject, "Alerta crítica de rendimiento");
    assert!(body.contains("Promedio actual: 4.0"));
    assert!(body.contains("Promedio anterior: 6.0"));
    drop(sent);

    let records = dispatcher.records_for_student("s1").expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, Some(FindingKind::CriticalPerformance));
    assert_eq!(records[0].title, "Alerta crítica de rendimiento");
}
