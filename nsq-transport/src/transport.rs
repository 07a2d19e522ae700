//! Transport assembly
//!
//! [`NsqTransport`] pairs a sender and a receiver for one topic. Each keeps
//! its own connection, opened lazily; both share one runtime.

use crate::ack::Acknowledger;
use crate::broker::{BrokerClient, Subscription};
use crate::config::TransportConfig;
use crate::envelope::Envelope;
use crate::listener::AckUnrecoverableMessageListener;
use crate::receiver::{NsqReceiver, ReceiverConfig};
use crate::rendezvous::Rendezvous;
use crate::sender::NsqSender;
use crate::serializer::Serializer;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Sends envelopes to a broker
pub trait Sender {
    /// Send, returning the envelope
    fn send(&mut self, envelope: Envelope) -> Result<Envelope>;
}

/// Receives envelopes from a broker
pub trait Receiver {
    /// Next envelope, if one arrives within the poll timeout
    fn get(&mut self) -> Result<Option<Envelope>>;

    /// Processing succeeded
    fn ack(&mut self, envelope: &Envelope) -> Result<()>;

    /// Processing will not be completed
    fn reject(&mut self, envelope: &Envelope) -> Result<()>;
}

/// Both directions
pub trait Transport: Sender + Receiver {}

impl<T: Sender + Receiver> Transport for T {}

impl Sender for NsqSender {
    fn send(&mut self, envelope: Envelope) -> Result<Envelope> {
        NsqSender::send(self, envelope)
    }
}

impl Receiver for NsqReceiver {
    fn get(&mut self) -> Result<Option<Envelope>> {
        NsqReceiver::get(self)
    }

    fn ack(&mut self, envelope: &Envelope) -> Result<()> {
        NsqReceiver::ack(self, envelope)
    }

    fn reject(&mut self, envelope: &Envelope) -> Result<()> {
        NsqReceiver::reject(self, envelope)
    }
}

/// Sender and receiver for one topic/channel
pub struct NsqTransport {
    config: TransportConfig,
    sender: NsqSender,
    receiver: NsqReceiver,
}

impl NsqTransport {
    /// Build a transport; no connection is opened yet
    pub fn new(
        config: TransportConfig,
        broker: Arc<dyn BrokerClient>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        config.validate()?;
        let rendezvous = Rendezvous::new(config.operation_timeout)?;

        let sender = NsqSender::new(
            config.address.clone(),
            config.topic.clone(),
            broker.clone(),
            serializer.clone(),
            rendezvous.clone(),
        );
        let receiver = NsqReceiver::new(
            ReceiverConfig {
                address: config.address.clone(),
                subscription: Subscription {
                    topic: config.topic.clone(),
                    channel: config.channel.clone(),
                    rdy_count: config.rdy_count,
                },
                poll_timeout: config.poll_timeout,
                heartbeat_interval: config.heartbeat_interval,
            },
            broker,
            serializer,
            rendezvous,
        );

        Ok(Self {
            config,
            sender,
            receiver,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Acknowledger bound to this transport's runtime
    pub fn acknowledger(&self) -> Acknowledger {
        self.receiver.acknowledger().clone()
    }

    /// Listener to register with the host bus failure dispatcher
    pub fn unrecoverable_listener(&self) -> AckUnrecoverableMessageListener {
        AckUnrecoverableMessageListener::new(self.acknowledger())
    }

    /// Split into independently owned halves
    pub fn into_parts(self) -> (NsqSender, NsqReceiver) {
        (self.sender, self.receiver)
    }
}

impl Sender for NsqTransport {
    fn send(&mut self, envelope: Envelope) -> Result<Envelope> {
        self.sender.send(envelope)
    }
}

impl Receiver for NsqTransport {
    fn get(&mut self) -> Result<Option<Envelope>> {
        self.receiver.get()
    }

    fn ack(&mut self, envelope: &Envelope) -> Result<()> {
        self.receiver.ack(envelope)
    }

    fn reject(&mut self, envelope: &Envelope) -> Result<()> {
        self.receiver.reject(envelope)
    }
}

/// Builds transports from `nsq://` DSNs
pub struct NsqTransportFactory {
    broker: Arc<dyn BrokerClient>,
}

impl NsqTransportFactory {
    /// Factory producing transports on top of `broker`
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self { broker }
    }

    /// Whether the DSN names this transport
    pub fn supports(&self, dsn: &str) -> bool {
        dsn.starts_with("nsq://")
    }

    /// Create a transport for `dsn`
    pub fn create_transport(
        &self,
        dsn: &str,
        serializer: Arc<dyn Serializer>,
    ) -> Result<NsqTransport> {
        if !self.supports(dsn) {
            return Err(Error::Config(format!("Unsupported DSN: {}", dsn)));
        }

        let config = TransportConfig::from_dsn(dsn)?;
        info!(
            "Creating NSQ transport for {}/{} on {}",
            config.topic, config.channel, config.address
        );
        NsqTransport::new(config, self.broker.clone(), serializer)
    }
}
