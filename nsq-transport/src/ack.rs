//! Acknowledgment of received envelopes
//!
//! Both acknowledge and reject resolve to FIN on the correlated message.
//! Redelivery is never a side effect of rejection: it only happens when the
//! host bus sends the received envelope again (see [`crate::NsqSender`]),
//! which turns into REQ with the requested delay.

use crate::broker::BrokerMessage;
use crate::envelope::Envelope;
use crate::metrics;
use crate::rendezvous::Rendezvous;
use crate::stamp::NsqReceivedStamp;
use crate::Result;
use tracing::debug;

/// Finishes correlated NSQ messages at most once
#[derive(Clone)]
pub struct Acknowledger {
    rendezvous: Rendezvous,
}

impl Acknowledger {
    /// Create acknowledger driving broker calls through `rendezvous`
    pub fn new(rendezvous: Rendezvous) -> Self {
        Self { rendezvous }
    }

    /// Processing succeeded
    pub fn acknowledge(&self, envelope: &Envelope) -> Result<()> {
        let stamp = NsqReceivedStamp::from_envelope(envelope)?;
        self.finish(stamp, "acknowledged").map(|_| ())
    }

    /// The broker should stop delivering this message
    pub fn reject(&self, envelope: &Envelope) -> Result<()> {
        let stamp = NsqReceivedStamp::from_envelope(envelope)?;
        self.finish(stamp, "rejected").map(|_| ())
    }

    /// FIN unless already processed. Returns whether FIN was sent.
    pub(crate) fn finish(&self, stamp: &NsqReceivedStamp, outcome: &str) -> Result<bool> {
        let message = stamp.message();
        if message.is_processed() {
            debug!("Message {} already processed, skipping FIN", message.id());
            metrics::record(stamp.topic(), "skipped");
            return Ok(false);
        }

        self.finish_message(message)?;
        debug!("Message {} {}", message.id(), outcome);
        metrics::record(stamp.topic(), outcome);
        Ok(true)
    }

    pub(crate) fn finish_message(&self, message: &BrokerMessage) -> Result<()> {
        self.rendezvous.wait("FIN", message.finish())
    }
}
