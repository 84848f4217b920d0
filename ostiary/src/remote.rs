//! Boundaries to the identity server
//!
//! Both remote calls are opaque to this crate: something that, given the
//! right inputs, eventually answers with a token or an error. Retries and
//! timeouts are the implementation's business; every error that escapes is
//! final as far as the session controller is concerned.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::{AccessToken, CsrfTokenRef, Password, SessionIdRef, Username};

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub use http::{HttpCredentialExchange, HttpTokenRenewer};

/// A failed call to the identity server
///
/// Carries the HTTP status when the server answered at all.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{}", display_remote_error(.status, .message))]
pub struct RemoteError {
    status: Option<u16>,
    message: String,
}

fn display_remote_error(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("identity server answered {status}: {message}"),
        None => format!("identity server unreachable: {message}"),
    }
}

impl RemoteError {
    /// An error response from the server
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A failure to reach the server or read its answer
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// The HTTP status, if the server answered
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// A description of the failure
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the server refused the caller's credentials or session
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status, Some(401) | Some(403))
    }

    /// Whether the server answered and refused the request itself
    ///
    /// Transport failures and server errors say nothing about the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self.status, Some(400..=499))
    }
}

/// Credentials presented on the login form
#[derive(Clone, Debug, Serialize)]
pub struct Credentials {
    /// The username or email address
    pub username: Username,
    /// The password
    pub password: Password,
}

impl Credentials {
    /// Constructs a set of credentials
    pub fn new(username: Username, password: Password) -> Self {
        Self { username, password }
    }
}

/// Renews the access token bound to a session
///
/// The session identifier is sent instead of the expiring token so that a
/// token already known to be stale is never replayed.
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    /// Requests a new access token for `session_id`
    async fn renew(&self, session_id: &SessionIdRef) -> Result<AccessToken, RemoteError>;
}

/// Exchanges user credentials for an access token
#[async_trait]
pub trait CredentialExchange: Send + Sync {
    /// Presents `credentials`, bound to the anti-forgery token `csrf_token`
    async fn exchange(
        &self,
        credentials: &Credentials,
        csrf_token: &CsrfTokenRef,
    ) -> Result<AccessToken, RemoteError>;
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Scripted identity server collaborators

    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex, PoisonError,
        },
        time::Duration,
    };

    use super::*;
    use crate::CsrfToken;

    type Script = Mutex<VecDeque<Result<AccessToken, RemoteError>>>;

    fn next(script: &Script) -> Result<AccessToken, RemoteError> {
        script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::transport("no scripted response")))
    }

    /// Answers renewals from a script, optionally after a delay
    #[derive(Debug, Default)]
    pub struct ScriptedRenewer {
        calls: AtomicUsize,
        script: Script,
        delay: Duration,
    }

    impl ScriptedRenewer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn then_ok(self, token: AccessToken) -> Self {
            self.script.lock().unwrap().push_back(Ok(token));
            self
        }

        pub fn then_err(self, error: RemoteError) -> Self {
            self.script.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRenewer for ScriptedRenewer {
        async fn renew(&self, _session_id: &SessionIdRef) -> Result<AccessToken, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            next(&self.script)
        }
    }

    /// Answers credential exchanges from a script and remembers what it saw
    #[derive(Debug, Default)]
    pub struct ScriptedExchange {
        calls: AtomicUsize,
        script: Script,
        last_csrf: Mutex<Option<CsrfToken>>,
    }

    impl ScriptedExchange {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn then_ok(self, token: AccessToken) -> Self {
            self.script.lock().unwrap().push_back(Ok(token));
            self
        }

        pub fn then_err(self, error: RemoteError) -> Self {
            self.script.lock().unwrap().push_back(Err(error));
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn last_csrf(&self) -> Option<CsrfToken> {
            self.last_csrf.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CredentialExchange for ScriptedExchange {
        async fn exchange(
            &self,
            _credentials: &Credentials,
            csrf_token: &CsrfTokenRef,
        ) -> Result<AccessToken, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_csrf.lock().unwrap() = Some(csrf_token.to_owned());
            next(&self.script)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_statuses() {
        assert!(RemoteError::with_status(401, "expired").is_unauthorized());
        assert!(RemoteError::with_status(403, "revoked").is_unauthorized());
        assert!(!RemoteError::with_status(503, "down").is_unauthorized());
        assert!(!RemoteError::transport("reset").is_unauthorized());
    }

    #[test]
    fn only_client_errors_are_rejections() {
        assert!(RemoteError::with_status(401, "bad credentials").is_rejection());
        assert!(RemoteError::with_status(422, "missing field").is_rejection());
        assert!(!RemoteError::with_status(502, "bad gateway").is_rejection());
        assert!(!RemoteError::transport("timed out").is_rejection());
    }

    #[test]
    fn display_mentions_status() {
        assert_eq!(
            RemoteError::with_status(503, "maintenance").to_string(),
            "identity server answered 503: maintenance"
        );
        assert_eq!(
            RemoteError::transport("connection refused").to_string(),
            "identity server unreachable: connection refused"
        );
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new(
            Username::from_static("alice@example.com"),
            Password::from_static("hunter2"),
        );
        let debug = format!("{:?}", credentials);
        assert!(debug.contains("***PASSWORD***"));
        assert!(!debug.contains("hunter2"));
    }
}
