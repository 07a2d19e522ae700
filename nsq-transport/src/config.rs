//! Transport configuration

use crate::{Error, Result};
use std::borrow::Cow;
use std::env;
use std::time::Duration;

/// Default nsqd TCP port
pub const DEFAULT_PORT: u16 = 4150;

/// Default nsqd host used when a DSN omits it
pub const DEFAULT_HOST: &str = "nsqd";

const EPHEMERAL_SUFFIX: &str = "#ephemeral";
const MAX_NAME_LEN: usize = 64;

/// NSQ transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// nsqd address (`tcp://host:port`)
    pub address: String,

    /// Topic messages are published to and consumed from
    pub topic: String,

    /// Channel the receiver subscribes with
    pub channel: String,

    /// Max in-flight messages announced to nsqd (RDY)
    pub rdy_count: u32,

    /// Upper bound on a single poll
    pub poll_timeout: Duration,

    /// Interval between keepalive round trips on an idle consumer
    pub heartbeat_interval: Duration,

    /// Upper bound on connect/publish/finish/requeue round trips
    pub operation_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            address: format!("tcp://{}:{}", DEFAULT_HOST, DEFAULT_PORT),
            topic: "messages".to_string(),
            channel: "default".to_string(),
            rdy_count: 1,
            poll_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            address: env::var("NSQ_ADDRESS").unwrap_or(defaults.address),
            topic: env::var("NSQ_TOPIC").unwrap_or(defaults.topic),
            channel: env::var("NSQ_CHANNEL").unwrap_or(defaults.channel),
            rdy_count: parse_var("NSQ_RDY")?.unwrap_or(defaults.rdy_count),
            poll_timeout: parse_var("NSQ_POLL_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_timeout),
            heartbeat_interval: parse_var("NSQ_HEARTBEAT_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            operation_timeout: parse_var("NSQ_OPERATION_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.operation_timeout),
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse an `nsq://host:port?topic=..&channel=..&rdy=..` DSN.
    ///
    /// Query keys and values are percent-decoded, so an ephemeral channel is
    /// written `channel=name%23ephemeral`. Anything after `#` is a fragment
    /// and ignored.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let without_fragment = dsn.split_once('#').map_or(dsn, |(head, _)| head);
        let rest = without_fragment
            .strip_prefix("nsq://")
            .ok_or_else(|| Error::Config(format!("The given NSQ DSN \"{}\" is invalid", dsn)))?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let authority = authority.trim_end_matches('/');

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    Error::Config(format!("Invalid port in NSQ DSN \"{}\": {}", dsn, e))
                })?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };
        let host = if host.is_empty() { DEFAULT_HOST } else { host };

        let mut config = Self {
            address: format!("tcp://{}:{}", host, port),
            ..Self::default()
        };

        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(dsn, raw_key)?;
            let value = decode_component(dsn, raw_value)?;
            let (key, value) = (&*key, &*value);
            match key {
                "topic" => config.topic = value.to_string(),
                "channel" => config.channel = value.to_string(),
                "rdy" => config.rdy_count = parse_option(key, value)?,
                "poll_timeout" => config.poll_timeout = Duration::from_millis(parse_option(key, value)?),
                "heartbeat_interval" => {
                    config.heartbeat_interval = Duration::from_millis(parse_option(key, value)?)
                }
                "operation_timeout" => {
                    config.operation_timeout = Duration::from_millis(parse_option(key, value)?)
                }
                other => tracing::debug!("Ignoring unknown NSQ DSN option: {}", other),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check names and limits against what nsqd accepts
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.topic, false) {
            return Err(Error::Config(format!("Invalid topic name: {:?}", self.topic)));
        }
        if !is_valid_name(&self.channel, true) {
            return Err(Error::Config(format!("Invalid channel name: {:?}", self.channel)));
        }
        if self.rdy_count == 0 {
            return Err(Error::Config("RDY count must be at least 1".to_string()));
        }
        if self.poll_timeout.is_zero() || self.operation_timeout.is_zero() {
            return Err(Error::Config("Timeouts must be non-zero".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("Heartbeat interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn is_valid_name(name: &str, allow_ephemeral: bool) -> bool {
    let base = match name.strip_suffix(EPHEMERAL_SUFFIX) {
        Some(base) if allow_ephemeral => base,
        _ => name,
    };

    !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn decode_component<'a>(dsn: &str, raw: &'a str) -> Result<Cow<'a, str>> {
    urlencoding::decode(raw)
        .map_err(|e| Error::Config(format!("Invalid encoding in NSQ DSN \"{}\": {}", dsn, e)))
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => parse_option(key, &value).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid value {:?} for {}: {}", value, key, e)))
}
