use herald_core::{BrokerAddress, BrokerConfig, DEFAULT_EXCHANGE};
use herald_events::DomainEvent;
use herald_transport::{
    CommitBuffer, ConnectionManager, InMemoryBroker, Publisher, RegistrationOptions, Subscriber,
};
use serde_json::json;

/// Declare a plain queue bound to the main exchange.
fn bind(broker: &InMemoryBroker, queue: &str, key: &str) {
    let mut sub = Subscriber::connect(broker, DEFAULT_EXCHANGE).unwrap();
    sub.register(|_| Ok(()), RegistrationOptions::new(queue, [key]))
        .unwrap();
}

#[test]
fn events_are_routed_by_topic() {
    let broker = InMemoryBroker::new();
    bind(&broker, "test-orders", "order.*");
    bind(&broker, "test-everything", "#");

    let mut publisher = Publisher::connect(&broker, DEFAULT_EXCHANGE).unwrap();
    publisher
        .send(&DomainEvent::new("order.placed", json!({"id": 1})))
        .unwrap();
    publisher
        .send(&DomainEvent::new("user.deleted", json!({"id": 2})))
        .unwrap();
    publisher.disconnect().unwrap();

    assert_eq!(broker.queue_size("test-orders"), Some(1));
    assert_eq!(broker.queue_size("test-everything"), Some(2));
}

#[test]
fn domain_object_id_survives_the_trip() {
    let broker = InMemoryBroker::new();
    bind(&broker, "test-object", "invoice.#");

    let event = DomainEvent::new("invoice.paid", json!({"amount": 12.5}))
        .with_domain_object_id("inv-17");
    let mut publisher = Publisher::connect(&broker, DEFAULT_EXCHANGE).unwrap();
    publisher.send(&event).unwrap();

    let (_, body) = broker.pop_message("test-object").unwrap();
    let decoded = DomainEvent::from_slice(&body).unwrap();
    assert_eq!(decoded, event);
    assert_eq!(decoded.domain_object_id(), Some("inv-17"));
}

#[test]
fn queue_inspection_through_connection_manager() {
    let broker = InMemoryBroker::new();
    bind(&broker, "test-inspect", "a.b");

    let mut conn = ConnectionManager::connect(&broker, DEFAULT_EXCHANGE).unwrap();
    assert!(conn.queue_exists("test-inspect").unwrap());
    assert!(!conn.queue_exists("test-missing").unwrap());
    assert_eq!(conn.queue_size("test-inspect").unwrap(), Some(0));

    conn.delete_queue("test-inspect").unwrap();
    assert!(!conn.queue_exists("test-inspect").unwrap());
}

#[test]
fn commit_buffer_publishes_on_commit_only() {
    let broker = InMemoryBroker::new();
    bind(&broker, "test-commit", "order.#");

    let mut buffer = CommitBuffer::new(&broker, DEFAULT_EXCHANGE);
    let first = buffer
        .defer("order.placed", json!({"id": 1}))
        .uuid_string()
        .to_string();
    buffer.defer("order.shipped", json!({"id": 1}));
    assert_eq!(broker.queue_size("test-commit"), Some(0));

    let published = buffer.commit().unwrap();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].uuid_string(), first);
    assert_eq!(broker.queue_size("test-commit"), Some(2));

    buffer.defer("order.cancelled", json!({"id": 1}));
    assert_eq!(buffer.rollback(), 1);
    assert!(buffer.commit().unwrap().is_empty());
    assert_eq!(broker.queue_size("test-commit"), Some(2));
}

#[test]
fn disabled_config_builds_inert_clients() {
    let config = BrokerConfig::disabled();
    let mut publisher = Publisher::from_config(&config).unwrap();
    assert!(publisher.is_disabled());
    publisher.publish(b"{}", "test.test").unwrap();

    let config = BrokerConfig::new(BrokerAddress::Disabled).with_exchange("other-events");
    let subscriber = Subscriber::from_config(&config).unwrap();
    assert!(subscriber.is_disabled());
    assert_eq!(subscriber.exchange(), "other-events");
}
