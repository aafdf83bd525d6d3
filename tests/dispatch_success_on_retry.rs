
use aulacore::db::{self, NotificationState};
use aulacore::dispatch::{DispatchOutcome, Dispatcher};
use aulacore::notify::CommsConfig;
use test_support::{at, critical_finding, email_contact, ScriptedEmail, ScriptedSms, StaticContacts};

// Attempt counting convention: `attempts` counts executed attempts, so
// a failure followed by a success lands at sent with attempts = 2.
#[test]
fn success_on_second_attempt_marks_sent_with_two_attempts() {
    let email = ScriptedEmail::new(1);
    let sms = ScriptedSms::new(0);
    let contacts = StaticContacts::new(vec![("s1", email_contact("tutor@example.com"))]);
    let dispatcher = Dispatcher::new(
        db::open_memory().expect("open db"),
        email.clone(),
        sms,
        contacts,
        CommsConfig::default(),
    );

    let outcome = dispatcher
        .dispatch(&critical_finding("s1"), at(9, 0))
        .expect("dispatch");
    let record_id = match outcome {
        DispatchOutcome::Retrying { record_id, attempts } => {
            assert_eq!(attempts, 1);
            record_id
        }
        other => panic!("expected a retrying outcome, got {:?}", other),
    };

    let summary = dispatcher.run_sweep(at(9, 30)).expect("retry sweep");
    assert_eq!(summary.delivered, 1);

    let record = dispatcher
        .record(&record_id)
        .expect("fetch record")
        .expect("record exists");
    assert_eq!(record.state, NotificationState::Sent);
    assert_eq!(record.attempts, 2);
    assert!(record.sent_at.is_some());
    assert_eq!(email.sent_count(), 1);

    // Sent records are out of the sweep's work list.
    let summary = dispatcher.run_sweep(at(10, 0)).expect("idle sweep");
    assert_eq!(summary.examined, 0);
}

#[test]
fn first_attempt_success_is_delivered_with_one_attempt() {
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

    let outcome = dispatcher
        .dispatch(&critical_finding("s1"), at(9, 0))
        .expect("dispatch");
    let record_id = match outcome {
        DispatchOutcome::Delivered { record_id } => record_id,
        other => panic!("expected delivery, got {:?}", other),
    };
    let record = dispatcher
        .record(&record_id)
        .expect("fetch record")
        .expect("record exists");
    assert_eq!(record.state, NotificationState::Sent);
    assert_eq!(record.attempts, 1);
}
