//! Tamper detection for the client-persisted session record
//!
//! The session record is independent of the bearer token. It pairs a
//! session identifier with an anti-forgery token and is persisted through a
//! [`SessionStore`]. Any record that is missing, unparsable, or carries an
//! identifier failing the format check is treated as absent.

use std::sync::{Arc, Mutex, PoisonError};

use base64::Engine;
use once_cell::sync::Lazy;
use ostiary_clock::{Clock, EpochMillis, System};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    config::SessionConfig,
    events::{SecurityEvent, SecurityEventKind, SecurityEventSink},
    store::{storage_unavailable, SessionStore, StorageError},
    CsrfToken, CsrfTokenRef, SessionId, SessionIdRef,
};

static SESSION_ID_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{20,}$").expect("session id pattern is valid"));

/// Whether `id` satisfies the session identifier format
pub fn is_valid_session_id(id: &str) -> bool {
    SESSION_ID_FORMAT.is_match(id)
}

/// A client-persisted session record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    session_id: SessionId,
    csrf_token: CsrfToken,
    created_at: EpochMillis,
    #[serde(skip)]
    last_validated_at: Option<EpochMillis>,
}

impl Session {
    /// The session identifier
    pub fn session_id(&self) -> &SessionIdRef {
        &self.session_id
    }

    /// The anti-forgery token bound to this session
    pub fn csrf_token(&self) -> &CsrfTokenRef {
        &self.csrf_token
    }

    /// When the session was minted
    pub fn created_at(&self) -> EpochMillis {
        self.created_at
    }

    /// When the session last passed an integrity check in this process
    pub fn last_validated_at(&self) -> Option<EpochMillis> {
        self.last_validated_at
    }

    fn is_well_formed(&self) -> bool {
        is_valid_session_id(self.session_id.as_str()) && !self.csrf_token.as_str().is_empty()
    }
}

/// Guards the persisted session record against absence and tampering
pub struct SessionIntegrityGuard<C = System> {
    store: Arc<dyn SessionStore>,
    events: Arc<dyn SecurityEventSink>,
    config: SessionConfig,
    last_validated_at: Mutex<Option<EpochMillis>>,
    clock: C,
}

impl SessionIntegrityGuard<System> {
    /// Constructs a guard over the record kept in `store`
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: Arc<dyn SecurityEventSink>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            events,
            config,
            last_validated_at: Mutex::new(None),
            clock: System,
        }
    }
}

impl<C> SessionIntegrityGuard<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> SessionIntegrityGuard<D> {
        SessionIntegrityGuard {
            store: self.store,
            events: self.events,
            config: self.config,
            last_validated_at: self.last_validated_at,
            clock,
        }
    }

    fn last_validated(&self) -> std::sync::MutexGuard<'_, Option<EpochMillis>> {
        self.last_validated_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock> SessionIntegrityGuard<C> {
    async fn read(&self) -> Result<Option<Session>, StorageError> {
        let raw = match self.store.load(&self.config.storage_key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        match serde_json::from_str::<Session>(&raw) {
            Ok(session) if session.is_well_formed() => Ok(Some(session)),
            Ok(_) => {
                tracing::debug!("persisted session fails format check, treating as absent");
                Ok(None)
            }
            Err(error) => {
                tracing::debug!(%error, "persisted session unparsable, treating as absent");
                Ok(None)
            }
        }
    }

    /// Whether a well-formed session record is persisted
    ///
    /// Does not modify any state.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store itself is unavailable.
    pub async fn validate(&self) -> Result<bool, StorageError> {
        Ok(self.read().await?.is_some())
    }

    /// The persisted session, if it is well-formed
    ///
    /// # Errors
    ///
    /// Returns an error only if the store itself is unavailable.
    pub async fn current(&self) -> Result<Option<Session>, StorageError> {
        let mut session = self.read().await?;
        if let Some(s) = &mut session {
            s.last_validated_at = *self.last_validated();
        }
        Ok(session)
    }

    /// Validates the record and notes when it last passed
    ///
    /// Invoked by periodic integrity checks.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store itself is unavailable.
    pub async fn check(&self) -> Result<bool, StorageError> {
        let valid = self.validate().await?;
        if valid {
            *self.last_validated() = Some(self.clock.now());
            tracing::trace!("session integrity check passed");
        }
        Ok(valid)
    }

    /// Mints and persists a fresh session
    ///
    /// `reason` is recorded with the `NEW_SESSION_CREATED` event.
    ///
    /// # Errors
    ///
    /// Returns an error if the new record cannot be persisted.
    pub async fn regenerate(&self, reason: &str) -> Result<Session, StorageError> {
        let now = self.clock.now();
        let session = Session {
            session_id: generate_session_id(self.config.session_id_len()),
            csrf_token: generate_csrf_token(),
            created_at: now,
            last_validated_at: None,
        };

        let raw = serde_json::to_string(&session).map_err(storage_unavailable)?;
        self.store.save(&self.config.storage_key, &raw).await?;
        *self.last_validated() = None;

        tracing::info!(reason, "created new session");
        self.events.log(
            SecurityEvent::new(SecurityEventKind::NewSessionCreated, now).with("reason", reason),
        );

        Ok(session)
    }

    /// Erases the persisted session
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(&self.config.storage_key).await?;
        *self.last_validated() = None;
        tracing::debug!("cleared persisted session");
        Ok(())
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for SessionIntegrityGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SessionIntegrityGuard")
            .field("config", &self.config)
            .field("last_validated_at", &*self.last_validated())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

fn generate_session_id(len: usize) -> SessionId {
    let id: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    SessionId::new(id)
}

fn generate_csrf_token() -> CsrfToken {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    CsrfToken::new(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use ostiary_clock::TestClock;

    use super::*;
    use crate::{events::MemorySink, store::InMemorySessionStore};

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        events: Arc<MemorySink>,
        guard: SessionIntegrityGuard<TestClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let events = Arc::new(MemorySink::new());
        let guard = SessionIntegrityGuard::new(store.clone(), events.clone(), SessionConfig::default())
            .with_clock(TestClock::new(EpochMillis(1_000)));
        Fixture {
            store,
            events,
            guard,
        }
    }

    #[test]
    fn session_id_format() {
        assert!(is_valid_session_id("abcdefghijklmnopqrst"));
        assert!(is_valid_session_id("A1_b2-C3_d4-E5_f6-G7_h8"));
        assert!(!is_valid_session_id("abcdefghijklmnopqrs"));
        assert!(!is_valid_session_id("abcdefghijklmnopqrs!"));
        assert!(!is_valid_session_id(""));
    }

    #[tokio::test]
    async fn absent_record_is_invalid() {
        let f = fixture();
        assert!(!f.guard.validate().await.unwrap());
        assert_eq!(f.guard.current().await.unwrap(), None);
    }

    #[tokio::test]
    async fn regenerate_then_validate() {
        let f = fixture();

        let session = f.guard.regenerate("initial_load").await.unwrap();

        assert!(f.guard.validate().await.unwrap());
        assert_eq!(session.session_id().as_str().len(), 32);
        assert!(is_valid_session_id(session.session_id().as_str()));
        assert!(!session.csrf_token().as_str().is_empty());
        assert_eq!(session.created_at(), EpochMillis(1_000));
        assert_eq!(f.guard.current().await.unwrap().as_ref(), Some(&session));

        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), SecurityEventKind::NewSessionCreated);
        assert_eq!(events[0].payload()["reason"], "initial_load");
    }

    #[tokio::test]
    async fn regenerated_sessions_are_distinct() {
        let f = fixture();
        let first = f.guard.regenerate("initial_load").await.unwrap();
        let second = f.guard.regenerate("integrity_violation").await.unwrap();

        assert_ne!(first.session_id(), second.session_id());
        assert_ne!(first.csrf_token(), second.csrf_token());
    }

    #[tokio::test]
    async fn truncated_session_id_is_invalid() {
        let f = fixture();
        let session = f.guard.regenerate("initial_load").await.unwrap();

        let tampered = serde_json::json!({
            "sessionId": &session.session_id().as_str()[..12],
            "csrfToken": session.csrf_token().as_str(),
            "createdAt": 1_000,
        });
        f.store
            .save("ostiary.session", &tampered.to_string())
            .await
            .unwrap();

        assert!(!f.guard.validate().await.unwrap());
    }

    #[tokio::test]
    async fn missing_csrf_token_is_invalid() {
        let f = fixture();
        f.store
            .save(
                "ostiary.session",
                r#"{"sessionId":"abcdefghijklmnopqrstuvwxyz","createdAt":1}"#,
            )
            .await
            .unwrap();
        assert!(!f.guard.validate().await.unwrap());

        f.store
            .save(
                "ostiary.session",
                r#"{"sessionId":"abcdefghijklmnopqrstuvwxyz","csrfToken":"","createdAt":1}"#,
            )
            .await
            .unwrap();
        assert!(!f.guard.validate().await.unwrap());
    }

    #[tokio::test]
    async fn garbage_record_is_invalid() {
        let f = fixture();
        f.store.save("ostiary.session", "not json").await.unwrap();
        assert!(!f.guard.validate().await.unwrap());
    }

    #[tokio::test]
    async fn check_records_last_validation() {
        let f = fixture();
        f.guard.regenerate("initial_load").await.unwrap();

        assert!(f.guard.check().await.unwrap());

        let session = f.guard.current().await.unwrap().unwrap();
        assert_eq!(session.last_validated_at(), Some(EpochMillis(1_000)));
    }

    #[tokio::test]
    async fn clear_removes_the_record() {
        let f = fixture();
        f.guard.regenerate("initial_load").await.unwrap();

        f.guard.clear().await.unwrap();

        assert!(!f.guard.validate().await.unwrap());
        assert_eq!(f.store.load("ostiary.session").await.unwrap(), None);
    }
}
