//! NSQ transport for an envelope/stamp message bus
//!
//! Bridges a host message bus to nsqd:
//! - Publishing with optional deferred delivery (PUB / DPUB)
//! - Polling with a bounded wait and connection keepalive
//! - Correlating received envelopes with their NSQ message for FIN/REQ
//! - Idempotent acknowledgment (at most one FIN per message)
//! - Poison message handling: undecodable payloads are finished, not retried
//! - Finishing messages the host bus has given up on
//!
//! All transport operations are blocking calls bounded by configured timeouts.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod ack;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod memory;
pub mod metrics;
pub mod receiver;
pub mod rendezvous;
pub mod sender;
pub mod serializer;
pub mod stamp;
pub mod transport;

pub use ack::Acknowledger;
pub use broker::{BrokerClient, BrokerMessage, Consumer, MessageAcker, Producer, Subscription};
pub use config::TransportConfig;
pub use envelope::{DelayStamp, Envelope, RedeliveryStamp, Stamp, TransportMessageIdStamp};
pub use error::{Error, Result};
pub use listener::{
    AckUnrecoverableMessageListener, FailureDispatcher, FailureListener, MessageFailedEvent,
};
pub use memory::{BrokerCall, InMemoryBroker};
pub use receiver::{NsqReceiver, ReceiverConfig};
pub use rendezvous::Rendezvous;
pub use sender::NsqSender;
pub use serializer::{EncodedEnvelope, JsonSerializer, Serializer};
pub use stamp::NsqReceivedStamp;
pub use transport::{NsqTransport, NsqTransportFactory, Receiver, Sender, Transport};
