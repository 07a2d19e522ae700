//! End-to-end transport scenarios against the in-memory broker
//!
//! Covers the full message lifecycle:
//! - publish → poll → acknowledge
//! - poison messages
//! - retry via REQ and attempt counting
//! - finishing messages the bus gave up on

use nsq_transport::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "orders";
const CHANNEL: &str = "billing";

fn transport(broker: &InMemoryBroker) -> NsqTransport {
    let config = TransportConfig {
        topic: TOPIC.to_string(),
        channel: CHANNEL.to_string(),
        poll_timeout: Duration::from_millis(100),
        operation_timeout: Duration::from_secs(1),
        ..TransportConfig::default()
    };
    NsqTransport::new(config, Arc::new(broker.clone()), Arc::new(JsonSerializer)).unwrap()
}

fn count(broker: &InMemoryBroker, pred: impl Fn(&BrokerCall) -> bool) -> usize {
    broker.calls().iter().filter(|c| pred(*c)).count()
}

fn is_finish(call: &BrokerCall) -> bool {
    matches!(call, BrokerCall::Finish { .. })
}

fn retry_count(envelope: &Envelope) -> u32 {
    envelope.last::<RedeliveryStamp>().unwrap().retry_count()
}

#[test]
fn test_publish_and_consume_first_attempt() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);

    transport.send(Envelope::new(json!({"id": 1}))).unwrap();

    assert_eq!(
        count(&broker, |c| matches!(c, BrokerCall::Publish { topic, .. } if topic == TOPIC)),
        1
    );

    let envelope = transport.get().unwrap().expect("message delivered");
    assert_eq!(envelope.message(), &json!({"id": 1}));
    assert_eq!(retry_count(&envelope), 0);

    transport.ack(&envelope).unwrap();
    assert_eq!(count(&broker, is_finish), 1);
    assert_eq!(broker.in_flight(TOPIC, CHANNEL), 0);
}

#[test]
fn test_broker_redelivery_counts_attempts() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    transport.send(Envelope::new(json!({"id": 1}))).unwrap();

    let first = transport.get().unwrap().unwrap();
    assert_eq!(retry_count(&first), 0);

    // message timeout twice without FIN
    broker.redeliver_in_flight(TOPIC, CHANNEL);
    let second = transport.get().unwrap().unwrap();
    broker.redeliver_in_flight(TOPIC, CHANNEL);
    let third = transport.get().unwrap().unwrap();

    assert_eq!(retry_count(&second), 1);
    assert_eq!(retry_count(&third), 2);
    assert_eq!(
        third.last::<TransportMessageIdStamp>().unwrap().id(),
        first.last::<TransportMessageIdStamp>().unwrap().id()
    );
}

#[test]
fn test_poison_message_finished_once() {
    let broker = InMemoryBroker::new();
    broker.inject(TOPIC, "\u{0}garbage");
    let mut transport = transport(&broker);

    let err = transport.get().unwrap_err();

    assert!(matches!(err, Error::DecodingFailed(_)));
    assert!(err.is_unrecoverable());
    assert_eq!(count(&broker, is_finish), 1);
    assert!(broker
        .calls()
        .iter()
        .all(|c| !matches!(c, BrokerCall::Requeue { .. })));
}

#[test]
fn test_resend_of_received_envelope_requeues() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    transport.send(Envelope::new(json!({"id": 1}))).unwrap();
    let received = transport.get().unwrap().unwrap();
    broker.clear_calls();

    transport.send(received.clone()).unwrap();

    let calls = broker.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], BrokerCall::Requeue { delay, .. } if delay.is_zero()));

    let redelivered = transport.get().unwrap().unwrap();
    assert_eq!(retry_count(&redelivered), 1);
}

#[test]
fn test_resend_with_delay_requeues_with_delay() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    transport.send(Envelope::new(json!({"id": 1}))).unwrap();
    let received = transport.get().unwrap().unwrap();
    broker.clear_calls();

    transport
        .send(received.with(DelayStamp::from_millis(250)))
        .unwrap();

    assert!(matches!(
        broker.calls().as_slice(),
        [BrokerCall::Requeue { delay, .. }] if *delay == Duration::from_millis(250)
    ));
    // still hidden
    assert!(transport.get().unwrap().is_none());
}

#[test]
fn test_resend_of_finished_envelope_is_noop() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    transport.send(Envelope::new(json!({"id": 1}))).unwrap();
    let received = transport.get().unwrap().unwrap();
    transport.ack(&received).unwrap();
    broker.clear_calls();

    let returned = transport.send(received).unwrap();

    assert!(broker.calls().is_empty());
    assert!(returned.last::<NsqReceivedStamp>().is_some());
}

#[test]
fn test_deferred_publish() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);

    transport
        .send(Envelope::new(json!({"id": 1})).with(DelayStamp::from_millis(300)))
        .unwrap();

    assert!(matches!(
        broker.calls().as_slice(),
        [BrokerCall::PublishDeferred { topic, delay, .. }]
            if topic == TOPIC && *delay == Duration::from_millis(300)
    ));
    assert!(transport.get().unwrap().is_none());

    std::thread::sleep(Duration::from_millis(300));
    let envelope = transport.get().unwrap().expect("visible after delay");
    assert_eq!(envelope.message(), &json!({"id": 1}));
}

#[test]
fn test_unrecoverable_failure_finishes_message() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    let mut dispatcher = FailureDispatcher::new();
    dispatcher.subscribe(Arc::new(transport.unrecoverable_listener()));

    transport.send(Envelope::new(json!({"id": 1}))).unwrap();
    let received = transport.get().unwrap().unwrap();

    let mut event = MessageFailedEvent::new(received, "handler exploded");
    dispatcher.dispatch(&mut event).unwrap();
    // dispatched again, e.g. by a second failing handler
    dispatcher.dispatch(&mut event).unwrap();

    assert_eq!(count(&broker, is_finish), 1);
    assert_eq!(broker.in_flight(TOPIC, CHANNEL), 0);
}

#[test]
fn test_retry_decision_precedes_unrecoverable_listener() {
    struct AlwaysRetry;

    impl FailureListener for AlwaysRetry {
        fn priority(&self) -> i32 {
            -1000
        }

        fn on_message_failed(&self, event: &mut MessageFailedEvent) -> Result<()> {
            event.set_for_retry();
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    let mut dispatcher = FailureDispatcher::new();
    // registered first, still runs last
    dispatcher.subscribe(Arc::new(transport.unrecoverable_listener()));
    dispatcher.subscribe(Arc::new(AlwaysRetry));

    transport.send(Envelope::new(json!({"id": 1}))).unwrap();
    let received = transport.get().unwrap().unwrap();

    let mut event = MessageFailedEvent::new(received, "flaky");
    dispatcher.dispatch(&mut event).unwrap();

    assert!(event.will_retry());
    assert_eq!(count(&broker, is_finish), 0);
    assert_eq!(broker.in_flight(TOPIC, CHANNEL), 1);
}

#[test]
fn test_unrecoverable_listener_after_poison_is_noop() {
    let broker = InMemoryBroker::new();
    let rendezvous = Rendezvous::new(Duration::from_secs(1)).unwrap();
    let acknowledger = Acknowledger::new(rendezvous.clone());
    let listener = AckUnrecoverableMessageListener::new(acknowledger.clone());

    broker.inject(TOPIC, "{}");
    let subscription = Subscription {
        topic: TOPIC.into(),
        channel: CHANNEL.into(),
        rdy_count: 1,
    };
    let message = rendezvous
        .wait("receive", async {
            broker
                .connect_consumer("mem", &subscription)
                .await?
                .next_message()
                .await
        })
        .unwrap();

    // finished by the poison path
    rendezvous.wait("FIN", message.finish()).unwrap();
    broker.clear_calls();

    let envelope = Envelope::new(json!({})).with(NsqReceivedStamp::new(message, TOPIC));
    let mut event = MessageFailedEvent::new(envelope, "decoding failed");

    assert!(listener.on_message_failed(&mut event).is_ok());
    assert!(broker.calls().is_empty());
}

#[test]
fn test_uncorrelated_envelopes_rejected() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);
    let envelope = Envelope::new(json!({"id": 1}));

    assert!(matches!(transport.ack(&envelope), Err(Error::NotCorrelated)));
    assert!(matches!(transport.reject(&envelope), Err(Error::NotCorrelated)));

    let mut event = MessageFailedEvent::new(envelope, "boom");
    assert!(matches!(
        transport.unrecoverable_listener().on_message_failed(&mut event),
        Err(Error::NotCorrelated)
    ));
    assert!(broker.calls().is_empty());
}

#[test]
fn test_transport_outage_surfaces_and_recovers() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);

    broker.set_available(false);
    for _ in 0..3 {
        assert!(matches!(
            transport.send(Envelope::new(json!(1))),
            Err(Error::TransportUnavailable(_))
        ));
        assert!(matches!(transport.get(), Err(Error::TransportUnavailable(_))));
    }

    broker.set_available(true);
    transport.send(Envelope::new(json!(2))).unwrap();
    let envelope = transport.get().unwrap().unwrap();
    assert_eq!(envelope.message(), &json!(2));
}

#[test]
fn test_delivery_order_preserved() {
    let broker = InMemoryBroker::new();
    let mut transport = transport(&broker);

    for id in 0..5 {
        transport.send(Envelope::new(json!({"id": id}))).unwrap();
    }

    for id in 0..5 {
        let envelope = transport.get().unwrap().unwrap();
        assert_eq!(envelope.message(), &json!({"id": id}));
        transport.ack(&envelope).unwrap();
    }
}
