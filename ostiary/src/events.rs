//! Append-only security event reporting
//!
//! Every component reports noteworthy outcomes through a
//! [`SecurityEventSink`]. Sinks never fail from the caller's point of view:
//! a sink that cannot record an event drops it and says so in the logs.
//!
//! Payloads must already be redacted by the caller. See [`redact`].

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use ostiary_clock::EpochMillis;
use serde::Serialize;
use serde_json::{Map, Value};

#[cfg(feature = "http")]
mod remote;

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub use remote::{RemoteSink, RemoteSinkConfig};

/// The kinds of security events emitted by this crate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    /// A fresh session record was minted
    NewSessionCreated,
    /// A periodic integrity check passed
    SessionValidated,
    /// The session record was found invalid while authenticated
    IntegrityViolation,
    /// Credentials were accepted
    LoginSucceeded,
    /// Credentials were rejected
    LoginFailed,
    /// A login attempt was refused because the client is locked out
    LoginBlocked,
    /// A client crossed the attempt threshold and was locked out
    LoginRateLimited,
    /// The access token was renewed
    TokenRenewed,
    /// Renewing the access token failed
    TokenRenewalFailed,
    /// An authenticated session ended
    SessionEnd,
    /// Something unusual was observed in the hosting environment
    EnvironmentAnomaly,
}

impl SecurityEventKind {
    /// The wire name of this kind
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewSessionCreated => "NEW_SESSION_CREATED",
            Self::SessionValidated => "SESSION_VALIDATED",
            Self::IntegrityViolation => "INTEGRITY_VIOLATION",
            Self::LoginSucceeded => "LOGIN_SUCCEEDED",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::LoginBlocked => "LOGIN_BLOCKED",
            Self::LoginRateLimited => "LOGIN_RATE_LIMITED",
            Self::TokenRenewed => "TOKEN_RENEWED",
            Self::TokenRenewalFailed => "TOKEN_RENEWAL_FAILED",
            Self::SessionEnd => "SESSION_END",
            Self::EnvironmentAnomaly => "ENVIRONMENT_ANOMALY",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single, immutable security event
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SecurityEvent {
    #[serde(rename = "type")]
    kind: SecurityEventKind,
    payload: Map<String, Value>,
    timestamp: EpochMillis,
}

impl SecurityEvent {
    /// Starts a new event with an empty payload
    pub fn new(kind: SecurityEventKind, timestamp: EpochMillis) -> Self {
        Self {
            kind,
            payload: Map::new(),
            timestamp,
        }
    }

    /// Adds a payload field
    ///
    /// Events are assembled before they are logged; once handed to a sink
    /// they are never changed.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }

    /// The kind of event
    pub fn kind(&self) -> SecurityEventKind {
        self.kind
    }

    /// The event payload
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// When the event happened
    pub fn timestamp(&self) -> EpochMillis {
        self.timestamp
    }
}

/// A destination for security events
pub trait SecurityEventSink: Send + Sync {
    /// Appends an event
    ///
    /// Implementations must not panic and must not block on I/O.
    fn log(&self, event: SecurityEvent);
}

impl<S: SecurityEventSink + ?Sized> SecurityEventSink for Arc<S> {
    fn log(&self, event: SecurityEvent) {
        (**self).log(event)
    }
}

/// A sink that records events as structured `tracing` records
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl SecurityEventSink for TracingSink {
    fn log(&self, event: SecurityEvent) {
        let payload = Value::Object(event.payload);
        match event.kind {
            SecurityEventKind::IntegrityViolation
            | SecurityEventKind::LoginRateLimited
            | SecurityEventKind::TokenRenewalFailed
            | SecurityEventKind::EnvironmentAnomaly => tracing::warn!(
                target: "ostiary::security",
                event_type = event.kind.as_str(),
                timestamp = event.timestamp.0,
                %payload,
                "security event"
            ),
            _ => tracing::info!(
                target: "ostiary::security",
                event_type = event.kind.as_str(),
                timestamp = event.timestamp.0,
                %payload,
                "security event"
            ),
        }
    }
}

/// A sink that keeps every event in memory
///
/// Useful for tests and for surfacing a local audit trail.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    /// Constructs an empty memory sink
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every event logged so far, oldest first
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The number of logged events of the given kind
    pub fn count(&self, kind: SecurityEventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl SecurityEventSink for MemorySink {
    fn log(&self, event: SecurityEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// A sink that forwards each event to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn SecurityEventSink>>,
}

impl FanoutSink {
    /// Constructs a fan-out with no destinations
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a destination
    pub fn with_sink(mut self, sink: impl SecurityEventSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }
}

impl fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl SecurityEventSink for FanoutSink {
    fn log(&self, event: SecurityEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.log(event.clone());
            }
            last.log(event);
        }
    }
}

pub mod redact {
    //! Helpers for redacting identifying values before they enter a payload

    /// Keeps the first three characters of an email or username and masks
    /// the rest
    ///
    /// ```
    /// assert_eq!(ostiary::events::redact::email("alice@example.com"), "ali***");
    /// assert_eq!(ostiary::events::redact::email("al"), "al***");
    /// ```
    pub fn email(value: &str) -> String {
        let mut redacted: String = value.chars().take(3).collect();
        redacted.push_str("***");
        redacted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_names() {
        let event = SecurityEvent::new(SecurityEventKind::NewSessionCreated, EpochMillis(42))
            .with("reason", "initial_load");

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "type": "NEW_SESSION_CREATED",
                "payload": { "reason": "initial_load" },
                "timestamp": 42,
            })
        );
    }

    #[test]
    fn memory_sink_appends_in_order() {
        let sink = MemorySink::new();
        sink.log(SecurityEvent::new(SecurityEventKind::LoginFailed, EpochMillis(1)));
        sink.log(SecurityEvent::new(SecurityEventKind::LoginSucceeded, EpochMillis(2)));

        let kinds: Vec<_> = sink.events().iter().map(SecurityEvent::kind).collect();
        assert_eq!(
            kinds,
            [SecurityEventKind::LoginFailed, SecurityEventKind::LoginSucceeded]
        );
        assert_eq!(sink.count(SecurityEventKind::LoginFailed), 1);
    }

    #[test]
    fn fanout_delivers_to_every_sink() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new()
            .with_sink(first.clone())
            .with_sink(TracingSink)
            .with_sink(second.clone());

        fanout.log(SecurityEvent::new(SecurityEventKind::SessionEnd, EpochMillis(7)));

        assert_eq!(first.count(SecurityEventKind::SessionEnd), 1);
        assert_eq!(second.count(SecurityEventKind::SessionEnd), 1);
    }

    #[test]
    #[tracing_test::traced_test]
    fn tracing_sink_records_event_type() {
        TracingSink.log(
            SecurityEvent::new(SecurityEventKind::IntegrityViolation, EpochMillis(9))
                .with("reason", "missing"),
        );

        assert!(logs_contain("INTEGRITY_VIOLATION"));
        assert!(logs_contain("security event"));
    }

    #[test]
    fn email_redaction_handles_multibyte_prefixes() {
        assert_eq!(redact::email("ñandú@example.com"), "ñan***");
        assert_eq!(redact::email(""), "***");
    }
}
