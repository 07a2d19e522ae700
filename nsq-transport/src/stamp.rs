//! Correlation between a received envelope and its NSQ message

use crate::broker::BrokerMessage;
use crate::envelope::{Envelope, Stamp};
use crate::{Error, Result};

/// Attached by the receiver to every envelope it produces.
///
/// Local metadata only: the sender strips it before encoding.
#[derive(Debug, Clone)]
pub struct NsqReceivedStamp {
    message: BrokerMessage,
    topic: String,
}

impl NsqReceivedStamp {
    /// Create stamp
    pub fn new(message: BrokerMessage, topic: impl Into<String>) -> Self {
        Self {
            message,
            topic: topic.into(),
        }
    }

    /// Underlying NSQ message
    pub fn message(&self) -> &BrokerMessage {
        &self.message
    }

    /// Topic the message was consumed from
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Correlation stamp of an envelope, or [`Error::NotCorrelated`]
    pub fn from_envelope(envelope: &Envelope) -> Result<&Self> {
        envelope.last::<Self>().ok_or(Error::NotCorrelated)
    }

    /// NSQ message behind an envelope, or [`Error::NotCorrelated`]
    pub fn message_from_envelope(envelope: &Envelope) -> Result<&BrokerMessage> {
        Self::from_envelope(envelope).map(Self::message)
    }
}

impl Stamp for NsqReceivedStamp {}
