//! NSQ Transport Demo
//!
//! Runs a small worker loop against the in-memory broker: publishes orders,
//! consumes them, retries failures with a delay and finishes messages whose
//! retries are exhausted.

use anyhow::Context;
use nsq_transport::{
    DelayStamp, Envelope, FailureDispatcher, FailureListener, InMemoryBroker, JsonSerializer,
    MessageFailedEvent, NsqTransport, Receiver, RedeliveryStamp, Result, Sender, TransportConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MAX_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(200);
const RUN_FOR: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    id: u64,
    amount_cents: u64,
}

/// Retries up to MAX_RETRIES times
struct RetryPolicy;

impl FailureListener for RetryPolicy {
    fn on_message_failed(&self, event: &mut MessageFailedEvent) -> Result<()> {
        let retries = event
            .envelope()
            .last::<RedeliveryStamp>()
            .map_or(0, RedeliveryStamp::retry_count);

        if retries < MAX_RETRIES {
            event.set_for_retry();
        }
        Ok(())
    }
}

fn handle(order: &OrderPlaced) -> anyhow::Result<()> {
    if order.amount_cents == 0 {
        anyhow::bail!("order {} has no amount", order.id);
    }
    info!("Processed order {} ({} cents)", order.id, order.amount_cents);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = TransportConfig::from_env().context("Loading NSQ configuration")?;
    info!(
        "Starting NSQ transport demo on {}/{}",
        config.topic, config.channel
    );

    let broker = InMemoryBroker::new();
    let mut transport =
        NsqTransport::new(config.clone(), Arc::new(broker.clone()), Arc::new(JsonSerializer))?;

    let mut dispatcher = FailureDispatcher::new();
    dispatcher.subscribe(Arc::new(RetryPolicy));
    dispatcher.subscribe(Arc::new(transport.unrecoverable_listener()));

    for (id, amount_cents) in [(1, 1250), (2, 0), (3, 990)] {
        transport.send(Envelope::from_message(&OrderPlaced { id, amount_cents })?)?;
    }
    broker.inject(&config.topic, "this is not json");

    let started = Instant::now();
    while started.elapsed() < RUN_FOR {
        let envelope = match transport.get() {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) if e.is_unrecoverable() => {
                warn!("Dropped undecodable message: {}", e);
                continue;
            }
            Err(e) => {
                error!("Receive failed: {}", e);
                continue;
            }
        };

        let outcome = envelope
            .decode_message::<OrderPlaced>()
            .map_err(anyhow::Error::from)
            .and_then(|order| handle(&order));

        match outcome {
            Ok(()) => transport.ack(&envelope)?,
            Err(e) => {
                let mut event = MessageFailedEvent::new(envelope, e.to_string());
                dispatcher.dispatch(&mut event)?;

                if event.will_retry() {
                    warn!("Retrying after failure: {}", event.error());
                    transport.send(event.into_envelope().with(DelayStamp::new(RETRY_DELAY)))?;
                } else {
                    error!("Gave up: {}", event.error());
                }
            }
        }
    }

    info!(
        "Demo finished: {} in flight, {} queued",
        broker.in_flight(&config.topic, &config.channel),
        broker.depth(&config.topic, &config.channel)
    );
    Ok(())
}
