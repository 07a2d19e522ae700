//! Message envelope and generic bus stamps
//!
//! An [`Envelope`] carries a business message plus an ordered list of stamps.
//! Stamps are keyed by type; lookups return the most recently added stamp of
//! the requested type. The envelope knows nothing about any particular broker.

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Metadata attachable to an [`Envelope`]
pub trait Stamp: Any + Send + Sync + fmt::Debug {}

#[derive(Clone)]
struct StampEntry {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

/// Business message plus stamps
#[derive(Clone)]
pub struct Envelope {
    message: serde_json::Value,
    stamps: Vec<StampEntry>,
}

impl Envelope {
    /// Wrap a message with no stamps
    pub fn new(message: serde_json::Value) -> Self {
        Self {
            message,
            stamps: Vec::new(),
        }
    }

    /// Wrap a typed message
    pub fn from_message<T: Serialize>(message: &T) -> Result<Self> {
        serde_json::to_value(message)
            .map(Self::new)
            .map_err(|e| Error::EncodingFailed(e.to_string()))
    }

    /// Business message
    pub fn message(&self) -> &serde_json::Value {
        &self.message
    }

    /// Decode the business message into a typed value
    pub fn decode_message<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.message).map_err(|e| Error::DecodingFailed(e.to_string()))
    }

    /// Consume the envelope, keeping only the message
    pub fn into_message(self) -> serde_json::Value {
        self.message
    }

    /// Add a stamp
    pub fn with<S: Stamp>(mut self, stamp: S) -> Self {
        self.stamps.push(StampEntry {
            name: type_name::<S>(),
            value: Arc::new(stamp),
        });
        self
    }

    /// Copy of this envelope with every stamp of type `S` removed
    pub fn without_all<S: Stamp>(&self) -> Self {
        Self {
            message: self.message.clone(),
            stamps: self
                .stamps
                .iter()
                .filter(|entry| !entry.value.as_ref().is::<S>())
                .cloned()
                .collect(),
        }
    }

    /// Most recently added stamp of type `S`
    pub fn last<S: Stamp>(&self) -> Option<&S> {
        self.stamps
            .iter()
            .rev()
            .find_map(|entry| entry.value.as_ref().downcast_ref::<S>())
    }

    /// All stamps of type `S`, oldest first
    pub fn all<S: Stamp>(&self) -> impl Iterator<Item = &S> + '_ {
        self.stamps
            .iter()
            .filter_map(|entry| entry.value.as_ref().downcast_ref::<S>())
    }

    /// Total number of stamps
    pub fn stamp_count(&self) -> usize {
        self.stamps.len()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field(
                "stamps",
                &self.stamps.iter().map(|entry| entry.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Broker-assigned identifier of the delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessageIdStamp {
    id: String,
}

impl TransportMessageIdStamp {
    /// Create stamp
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Message ID
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Stamp for TransportMessageIdStamp {}

/// How many times this message was redelivered (0 on first delivery)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryStamp {
    retry_count: u32,
}

impl RedeliveryStamp {
    /// Create stamp
    pub fn new(retry_count: u32) -> Self {
        Self { retry_count }
    }

    /// Retry count
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl Stamp for RedeliveryStamp {}

/// Keep the message invisible to consumers for the given duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayStamp {
    delay: Duration,
}

impl DelayStamp {
    /// Create stamp
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay in milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    /// Delay
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Stamp for DelayStamp {}
