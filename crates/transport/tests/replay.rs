use std::time::Duration;

use herald_core::{BrokerError, DEFAULT_EXCHANGE};
use herald_events::{DomainEvent, HandlerError};
use herald_transport::{
    InMemoryBroker, RegistrationOptions, ReplayDecision, Replayer, Subscriber, always_retry,
    publish_event,
};
use serde_json::json;

/// Dead-letter `count` events for `queue` by consuming them with a failing
/// handler. Returns the ids in publish order.
fn dead_letter(broker: &InMemoryBroker, queue: &str, count: usize) -> Vec<String> {
    let routing_key = format!("{queue}.event");
    let mut sub = Subscriber::connect(broker, DEFAULT_EXCHANGE).unwrap();
    sub.register(
        |_: &DomainEvent| Err(HandlerError::msg("always fails")),
        RegistrationOptions::new(queue, [routing_key.as_str()]).with_dead_letter(true),
    )
    .unwrap();

    let ids = (0..count)
        .map(|i| {
            publish_event(broker, routing_key.as_str(), json!({ "n": i }))
                .unwrap()
                .uuid_string()
                .to_string()
        })
        .collect();
    sub.start_consuming(Some(Duration::from_millis(300))).unwrap();
    assert_eq!(broker.queue_size(&format!("{queue}-dl")), Some(count as u32));
    ids
}

fn replayer(broker: &InMemoryBroker) -> Replayer {
    Replayer::connect(broker, DEFAULT_EXCHANGE).unwrap()
}

#[test]
fn retry_moves_message_back_to_work_queue() {
    let broker = InMemoryBroker::new();
    let ids = dead_letter(&broker, "test-replay", 1);

    let remaining = replayer(&broker)
        .replay_one("test-replay", always_retry)
        .unwrap();

    assert_eq!(remaining, 0);
    assert_eq!(broker.queue_size("test-replay-dl"), Some(0));
    let (props, body) = broker.pop_message("test-replay").unwrap();
    let event = DomainEvent::from_slice(&body).unwrap();
    assert_eq!(event.uuid_string(), ids[0]);
    assert_eq!(event.data(), &json!({"n": 0}));
    // Replayed messages start without dead-letter history.
    assert!(props.header("x-death").is_none());
}

#[test]
fn discard_removes_message() {
    let broker = InMemoryBroker::new();
    dead_letter(&broker, "test-discard", 1);

    replayer(&broker)
        .replay_one("test-discard", |_| Ok(ReplayDecision::Discard))
        .unwrap();

    assert_eq!(broker.queue_size("test-discard-dl"), Some(0));
    assert_eq!(broker.queue_size("test-discard"), Some(0));
}

#[test]
fn leave_keeps_message_at_head() {
    let broker = InMemoryBroker::new();
    let ids = dead_letter(&broker, "test-leave", 2);

    let mut replayer = replayer(&broker);
    let remaining = replayer
        .replay_one("test-leave", |letter| {
            assert_eq!(letter.queue, "test-leave");
            assert_eq!(letter.routing_key, "test-leave.event");
            Ok(ReplayDecision::Leave)
        })
        .unwrap();
    assert_eq!(remaining, 1);
    assert_eq!(broker.queue_size("test-leave-dl"), Some(2));

    let mut first = None;
    replayer
        .replay_one("test-leave", |letter| {
            first = Some(letter.event().unwrap().uuid_string().to_string());
            Ok(ReplayDecision::Leave)
        })
        .unwrap();
    assert_eq!(first.as_deref(), Some(ids[0].as_str()));
}

#[test]
fn empty_dead_letter_queue_returns_zero() {
    let broker = InMemoryBroker::new();
    dead_letter(&broker, "test-empty", 0);

    let remaining = replayer(&broker)
        .replay_one("test-empty", |_| panic!("decision must not be asked"))
        .unwrap();
    assert_eq!(remaining, 0);
}

#[test]
fn invalid_decision_leaves_message_and_fails() {
    let broker = InMemoryBroker::new();
    dead_letter(&broker, "test-invalid", 1);

    let err = replayer(&broker)
        .replay_one("test-invalid", |_| "maybe".parse())
        .unwrap_err();

    assert_eq!(err, BrokerError::InvalidReplayDecision("maybe".into()));
    assert_eq!(broker.queue_size("test-invalid-dl"), Some(1));
}

#[test]
fn replay_all_drains_dead_letter_queue_in_order() {
    let broker = InMemoryBroker::new();
    let ids = dead_letter(&broker, "test-all", 3);

    let mut seen = Vec::new();
    let remaining = replayer(&broker)
        .replay_all("test-all", |letter| {
            seen.push(letter.event()?.uuid_string().to_string());
            Ok(ReplayDecision::Retry)
        })
        .unwrap();

    assert_eq!(remaining, 0);
    assert_eq!(seen, ids);
    assert_eq!(broker.queue_size("test-all-dl"), Some(0));
    assert_eq!(broker.queue_size("test-all"), Some(3));
}

#[test]
fn replay_all_with_leave_terminates() {
    let broker = InMemoryBroker::new();
    dead_letter(&broker, "test-all-leave", 2);

    let mut asked = 0;
    replayer(&broker)
        .replay_all("test-all-leave", |_| {
            asked += 1;
            Ok(ReplayDecision::Leave)
        })
        .unwrap();

    assert_eq!(asked, 2);
    assert_eq!(broker.queue_size("test-all-leave-dl"), Some(2));
}

#[test]
fn replayed_event_is_consumed_again() {
    let broker = InMemoryBroker::new();
    let ids = dead_letter(&broker, "test-roundtrip", 1);
    replayer(&broker)
        .replay_one("test-roundtrip", always_retry)
        .unwrap();

    let mut sub = Subscriber::connect(&broker, DEFAULT_EXCHANGE).unwrap();
    let stop = sub.stop_handle();
    let (tx, rx) = std::sync::mpsc::channel();
    sub.register(
        move |event: &DomainEvent| {
            tx.send(event.uuid_string().to_string()).unwrap();
            stop.stop();
            Ok(())
        },
        RegistrationOptions::new("test-roundtrip", ["test-roundtrip.event"]).with_dead_letter(true),
    )
    .unwrap();
    sub.start_consuming(Some(Duration::from_secs(5))).unwrap();

    assert_eq!(rx.try_recv().unwrap(), ids[0]);
}
