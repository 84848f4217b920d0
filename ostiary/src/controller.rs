//! The composition root of the session lifecycle
//!
//! A [`SessionLifecycleController`] owns one instance of every other
//! component and is the only place authenticated state is ever cleared.
//! Other components may only ask for a sign-out; the controller decides
//! whether the request still applies and performs the teardown.

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use async_trait::async_trait;
use ostiary_clock::{Clock, DurationMillis, System};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    config::LifecycleConfig,
    events::{redact, SecurityEvent, SecurityEventKind, SecurityEventSink, TracingSink},
    integrity::{Session, SessionIntegrityGuard},
    limiter::{ClientContext, FingerprintStrategy, LoginRateLimiter, UserAgentOrigin},
    refresh::{RefreshCoordinator, RefreshError, SignOutRequest},
    remote::{CredentialExchange, Credentials, RemoteError, TokenRenewer},
    store::{SessionStore, StorageError},
    token,
    triggers::{RecheckTarget, Signal, TriggerMultiplexer},
    AccessToken, AccessTokenRef, ClientFingerprint,
};

/// Why a session was ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignOutReason {
    /// The user asked to sign out
    UserLogout,
    /// The access token expired
    TokenExpired,
    /// The identity server would not renew the access token
    RenewalFailed,
    /// The persisted session record went missing or was tampered with
    IntegrityViolation,
}

impl SignOutReason {
    /// A stable code for logs and security events
    pub const fn code(self) -> &'static str {
        match self {
            SignOutReason::UserLogout => "user_logout",
            SignOutReason::TokenExpired => "token_expired",
            SignOutReason::RenewalFailed => "renewal_failed",
            SignOutReason::IntegrityViolation => "integrity_violation",
        }
    }

    /// The notice to show once before returning the user to sign in
    ///
    /// Expected endings are silent.
    pub const fn notice(self) -> Option<&'static str> {
        match self {
            SignOutReason::UserLogout | SignOutReason::TokenExpired => None,
            SignOutReason::RenewalFailed => {
                Some("Your session could not be renewed. Please sign in again.")
            }
            SignOutReason::IntegrityViolation => {
                Some("Your session was reset for your security. Please sign in again.")
            }
        }
    }
}

impl fmt::Display for SignOutReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The authentication state published to the view layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    /// No one has signed in yet
    Unauthenticated,
    /// An access token is held
    Authenticated,
    /// The session was ended and the user should be sent to sign in
    SignedOut {
        /// Why the session ended
        reason: SignOutReason,
    },
}

/// A failed login
#[derive(Debug, Error)]
pub enum LoginError {
    /// Too many failed attempts; the client must wait before trying again
    #[error("too many failed login attempts, try again in {} seconds", .retry_after.as_secs_ceil())]
    RateLimited {
        /// Time left on the lockout
        retry_after: DurationMillis,
        /// Attempts left once the lockout ends
        remaining_attempts: u32,
    },
    /// The identity server refused the credentials
    #[error("credentials rejected, {remaining_attempts} attempts remaining")]
    CredentialRejected {
        /// Attempts left before the client is locked out
        remaining_attempts: u32,
        /// The identity server's answer
        #[source]
        source: RemoteError,
    },
    /// The identity server could not be reached or failed to answer
    ///
    /// Does not count against the client's login attempts.
    #[error("identity server unavailable")]
    Unavailable(#[source] RemoteError),
    /// The session record could not be read or written
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A failure to provide an access token to an API caller
#[derive(Debug, Error)]
pub enum AccessError {
    /// No one is signed in
    #[error("not signed in")]
    NotAuthenticated,
    /// The token could not be kept fresh
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    /// The session record could not be read
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Assembles a [`SessionLifecycleController`]
pub struct SessionLifecycleBuilder<C = System> {
    renewer: Arc<dyn TokenRenewer>,
    exchange: Arc<dyn CredentialExchange>,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn SecurityEventSink>,
    client: ClientContext,
    fingerprint: Arc<dyn FingerprintStrategy>,
    config: LifecycleConfig,
    clock: C,
}

impl<C> SessionLifecycleBuilder<C> {
    /// Replaces the default configuration
    pub fn with_config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    /// Sends security events to `events` instead of `tracing`
    pub fn with_event_sink(mut self, events: Arc<dyn SecurityEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Describes the client for login rate limiting
    pub fn with_client(mut self, client: ClientContext) -> Self {
        self.client = client;
        self
    }

    /// Replaces the default user agent and origin fingerprint
    pub fn with_fingerprint_strategy(
        mut self,
        strategy: impl FingerprintStrategy + 'static,
    ) -> Self {
        self.fingerprint = Arc::new(strategy);
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> SessionLifecycleBuilder<D> {
        SessionLifecycleBuilder {
            renewer: self.renewer,
            exchange: self.exchange,
            store: self.store,
            events: self.events,
            client: self.client,
            fingerprint: self.fingerprint,
            config: self.config,
            clock,
        }
    }
}

impl<C: Clock + Clone> SessionLifecycleBuilder<C> {
    /// Builds the controller
    ///
    /// Nothing runs until [`SessionLifecycleController::start`] is called.
    pub fn build(self) -> SessionLifecycleController<C> {
        let (sign_out_tx, sign_out_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::Unauthenticated);

        let guard = Arc::new(
            SessionIntegrityGuard::new(
                self.store,
                Arc::clone(&self.events),
                self.config.session.clone(),
            )
            .with_clock(self.clock.clone()),
        );

        let limiter = LoginRateLimiter::new(self.config.rate_limit.clone(), Arc::clone(&self.events))
            .with_clock(self.clock.clone());

        let refresh = RefreshCoordinator::new_with_clock(
            self.renewer,
            Arc::clone(&self.events),
            self.config.refresh.clone(),
            sign_out_tx,
            self.clock.clone(),
        );

        SessionLifecycleController {
            inner: Arc::new(Inner {
                guard,
                limiter,
                refresh,
                exchange: self.exchange,
                events: self.events,
                triggers: TriggerMultiplexer::new(self.config.triggers.clone()),
                fingerprint: self.fingerprint.fingerprint(&self.client),
                expiry_warning: self.config.expiry_warning_lead(),
                token: Mutex::new(None),
                status,
                sign_outs: Arc::new(tokio::sync::Mutex::new(sign_out_rx)),
                listener: Mutex::new(None),
                clock: self.clock,
            }),
        }
    }
}

impl<C> fmt::Debug for SessionLifecycleBuilder<C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionLifecycleBuilder")
            .field("client", &self.client)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

struct Listener {
    _halt: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner<C> {
    guard: Arc<SessionIntegrityGuard<C>>,
    limiter: LoginRateLimiter<C>,
    refresh: RefreshCoordinator<C>,
    exchange: Arc<dyn CredentialExchange>,
    events: Arc<dyn SecurityEventSink>,
    triggers: TriggerMultiplexer,
    fingerprint: ClientFingerprint,
    expiry_warning: DurationMillis,
    token: Mutex<Option<AccessToken>>,
    status: watch::Sender<SessionStatus>,
    sign_outs: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SignOutRequest>>>,
    listener: Mutex<Option<Listener>>,
    clock: C,
}

impl<C> Inner<C> {
    fn token(&self) -> MutexGuard<'_, Option<AccessToken>> {
        self.token.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_token(&self) -> Option<AccessToken> {
        self.token().clone()
    }

    fn install(&self, token: AccessToken) {
        *self.token() = Some(token);
        self.status.send_replace(SessionStatus::Authenticated);
    }

    fn install_renewed(&self, previous: &AccessTokenRef, renewed: &AccessTokenRef) {
        let mut held = self.token();
        match &mut *held {
            Some(token) if token.as_str() == previous.as_str() => {
                if previous.as_str() != renewed.as_str() {
                    *token = renewed.to_owned();
                    tracing::trace!("installed renewed access token");
                }
            }
            _ => tracing::trace!("held token changed during renewal, discarding result"),
        }
    }
}

impl<C> Inner<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Ends the session if `expected` is still the held token, or if any
    /// token is held when `expected` is `None`
    ///
    /// The held token, the `SESSION_END` event and the published status
    /// change together before anything is awaited. The persisted record is
    /// then cleared on a task of its own, so dropping the caller never
    /// leaves the teardown half done.
    async fn end_session(&self, reason: SignOutReason, expected: Option<&AccessTokenRef>) -> bool {
        {
            let mut held = self.token();
            let applies = match (held.as_ref(), expected) {
                (None, _) => false,
                (Some(token), Some(expected)) => token.as_str() == expected.as_str(),
                (Some(_), None) => true,
            };
            if !applies {
                return false;
            }
            *held = None;
        }

        self.events.log(
            SecurityEvent::new(SecurityEventKind::SessionEnd, self.clock.now())
                .with("reason", reason.code()),
        );
        self.status
            .send_replace(SessionStatus::SignedOut { reason });
        tracing::info!(reason = reason.code(), "session ended");

        let guard = Arc::clone(&self.guard);
        let teardown = tokio::spawn(async move {
            if let Err(error) = guard.clear().await {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "unable to clear persisted session during sign-out"
                );
            }

            if reason == SignOutReason::IntegrityViolation {
                if let Err(error) = guard.regenerate("integrity_violation").await {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "unable to create a fresh session after integrity violation"
                    );
                }
            }
        });

        if let Err(err) = teardown.await {
            if err.is_panic() {
                tracing::error!("session teardown panicked!")
            }
        }

        true
    }

    async fn honor(&self, request: SignOutRequest) {
        if !self.end_session(request.reason, Some(&request.token)).await {
            tracing::debug!(
                reason = request.reason.code(),
                "ignoring sign-out request for a token no longer held"
            );
        }
    }

    async fn integrity_violation(&self, current: &AccessTokenRef) {
        tracing::warn!("persisted session failed integrity check while signed in");
        self.events.log(SecurityEvent::new(
            SecurityEventKind::IntegrityViolation,
            self.clock.now(),
        ));
        self.end_session(SignOutReason::IntegrityViolation, Some(current))
            .await;
    }

    async fn freshen(&self, current: AccessToken) -> Result<AccessToken, AccessError> {
        let session = match self.guard.current().await? {
            Some(session) => session,
            None => {
                self.integrity_violation(&current).await;
                return Err(AccessError::NotAuthenticated);
            }
        };

        match self
            .refresh
            .ensure_fresh(&current, session.session_id())
            .await
        {
            Ok(token) => {
                self.install_renewed(&current, &token);
                Ok(token)
            }
            Err(error) => {
                match &error {
                    RefreshError::Expired => {
                        self.end_session(SignOutReason::TokenExpired, Some(&current))
                            .await;
                    }
                    RefreshError::RenewalFailed(_) => {
                        self.end_session(SignOutReason::RenewalFailed, Some(&current))
                            .await;
                    }
                    RefreshError::Abandoned => {}
                }
                Err(error.into())
            }
        }
    }
}

#[async_trait]
impl<C> RecheckTarget for Inner<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn recheck(&self, signal: Signal) {
        if signal == Signal::PeriodicTick {
            self.limiter.prune();
        }

        let current = match self.current_token() {
            Some(token) => token,
            None => {
                tracing::trace!(%signal, "not signed in, nothing to recheck");
                return;
            }
        };

        match self.guard.check().await {
            Ok(true) => {}
            Ok(false) => {
                self.integrity_violation(&current).await;
                return;
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "session store unavailable, skipping recheck"
                );
                return;
            }
        }

        if token::is_expired(&current, self.clock.now()) {
            tracing::debug!("access token expired, signing out");
            self.end_session(SignOutReason::TokenExpired, Some(&current))
                .await;
            return;
        }

        if let Err(error) = self.freshen(current).await {
            tracing::debug!(
                %signal,
                error = (&error as &dyn error::Error),
                "recheck could not keep the token fresh"
            );
        }
    }
}

/// Drives the lifecycle of a single client session
///
/// Construct one per application instance with [`builder`][Self::builder]
/// and share it by reference. Dropping the controller stops it.
pub struct SessionLifecycleController<C = System> {
    inner: Arc<Inner<C>>,
}

impl SessionLifecycleController<System> {
    /// Starts assembling a controller from its remote collaborators and
    /// session store
    ///
    /// Security events go to `tracing` and the client is fingerprinted by
    /// user agent and origin unless configured otherwise.
    pub fn builder(
        renewer: Arc<dyn TokenRenewer>,
        exchange: Arc<dyn CredentialExchange>,
        store: Arc<dyn SessionStore>,
    ) -> SessionLifecycleBuilder<System> {
        SessionLifecycleBuilder {
            renewer,
            exchange,
            store,
            events: Arc::new(TracingSink),
            client: ClientContext::default(),
            fingerprint: Arc::new(UserAgentOrigin),
            config: LifecycleConfig::default(),
            clock: System,
        }
    }
}

impl<C> SessionLifecycleController<C> {
    /// Tears down the signal listeners, the periodic timer and the
    /// sign-out listener
    ///
    /// Nothing is cancelled midway. A recheck, renewal or sign-out already
    /// under way completes and its result is applied, but no new work
    /// starts. Safe to call any number of times.
    pub fn stop(&self) {
        self.inner.triggers.stop();
        if self.inner.listener().take().is_some() {
            tracing::info!("session lifecycle stopped");
        }
    }

    /// Delivers an environment signal
    ///
    /// Returns `false` while the controller is stopped.
    pub fn signal(&self, signal: Signal) -> bool {
        self.inner.triggers.notify(signal)
    }

    /// The number of registered signal listeners and timers
    pub fn active_listeners(&self) -> usize {
        self.inner.triggers.active_listeners()
    }

    /// Whether an access token is held
    pub fn is_authenticated(&self) -> bool {
        self.inner.token().is_some()
    }

    /// The current authentication status
    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    /// Watches the authentication status
    ///
    /// The view layer redirects to sign in on
    /// [`SessionStatus::SignedOut`], showing the reason's
    /// [`notice`][SignOutReason::notice] if it has one.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }
}

impl<C: Clock> SessionLifecycleController<C> {
    /// How much longer the held token remains valid
    pub fn time_until_expiry(&self) -> Option<DurationMillis> {
        let token = self.inner.current_token()?;
        Some(token::time_remaining(&token, self.inner.clock.now()))
    }

    /// The time left on the held token, once it is close enough to expiry
    /// to warn the user
    pub fn expiry_warning(&self) -> Option<DurationMillis> {
        self.time_until_expiry()
            .filter(|remaining| *remaining <= self.inner.expiry_warning)
    }

    /// Whether this client is locked out of logging in
    pub fn is_locked_out(&self) -> bool {
        !self.inner.limiter.is_allowed(&self.inner.fingerprint)
    }

    /// How long until this client may log in again, if it is locked out
    pub fn lockout_remaining(&self) -> Option<DurationMillis> {
        self.inner.limiter.lockout_remaining(&self.inner.fingerprint)
    }

    /// Login attempts left before this client is locked out
    pub fn remaining_attempts(&self) -> u32 {
        self.inner.limiter.remaining_attempts(&self.inner.fingerprint)
    }
}

impl<C> SessionLifecycleController<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Validates or regenerates the persisted session, then starts
    /// listening for environment signals and sign-out requests
    ///
    /// # Errors
    ///
    /// Returns an error if the session store is unavailable.
    pub async fn start(&self) -> Result<(), StorageError> {
        let inner = &self.inner;

        if inner.guard.check().await? {
            tracing::debug!("persisted session is valid");
            inner.events.log(SecurityEvent::new(
                SecurityEventKind::SessionValidated,
                inner.clock.now(),
            ));
        } else {
            inner.guard.regenerate("initial_load").await?;
        }

        self.spawn_sign_out_listener();

        let weak: Weak<Inner<C>> = Arc::downgrade(inner);
        let target: Weak<dyn RecheckTarget> = weak;
        inner.triggers.start(target);

        tracing::info!("session lifecycle started");
        Ok(())
    }

    fn spawn_sign_out_listener(&self) {
        let mut listener = self.inner.listener();
        if listener.as_ref().map_or(false, |l| !l.task.is_finished()) {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let requests = Arc::clone(&self.inner.sign_outs);
        let (halt, mut halted) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut requests = requests.lock().await;
            loop {
                let request = tokio::select! {
                    biased;
                    _ = &mut halted => break,
                    request = requests.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                match inner.upgrade() {
                    Some(inner) => inner.honor(request).await,
                    None => break,
                }
            }
            tracing::debug!("sign-out listener halted");
        });

        *listener = Some(Listener { _halt: halt, task });
    }

    /// Installs an access token obtained elsewhere, such as one restored
    /// at start-up
    ///
    /// Returns `false`, leaving the state untouched, if the token has
    /// already expired or no valid session is persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store is unavailable.
    pub async fn adopt_token(&self, token: AccessToken) -> Result<bool, StorageError> {
        if token::is_expired(&token, self.inner.clock.now()) {
            tracing::debug!("refusing to adopt an expired access token");
            return Ok(false);
        }

        if !self.inner.guard.validate().await? {
            tracing::debug!("refusing to adopt an access token without a valid session");
            return Ok(false);
        }

        self.inner.install(token);
        tracing::debug!("adopted access token");
        Ok(true)
    }

    /// Exchanges credentials for an access token
    ///
    /// A failure never disturbs a session that is already signed in.
    ///
    /// # Errors
    ///
    /// Returns [`LoginError::RateLimited`] without contacting the identity
    /// server while this client is locked out, and
    /// [`LoginError::CredentialRejected`] when the identity server refuses
    /// the credentials. Only refusals count against the client's attempts;
    /// transport failures and server errors yield
    /// [`LoginError::Unavailable`].
    pub async fn login(&self, credentials: &Credentials) -> Result<(), LoginError> {
        let inner = &self.inner;
        let fingerprint = &inner.fingerprint;
        let username = redact::email(credentials.username.as_str());

        if !inner.limiter.is_allowed(fingerprint) {
            let retry_after = inner
                .limiter
                .lockout_remaining(fingerprint)
                .unwrap_or(DurationMillis::ZERO);
            tracing::debug!(retry_after = retry_after.0, "login blocked by rate limit");
            inner.events.log(
                SecurityEvent::new(SecurityEventKind::LoginBlocked, inner.clock.now())
                    .with("username", username)
                    .with("retryAfterSecs", retry_after.as_secs_ceil()),
            );
            return Err(LoginError::RateLimited {
                retry_after,
                remaining_attempts: 0,
            });
        }

        let session = match inner.guard.current().await? {
            Some(session) => session,
            None => inner.guard.regenerate("login").await?,
        };

        match inner
            .exchange
            .exchange(credentials, session.csrf_token())
            .await
        {
            Ok(token) => {
                inner.limiter.reset(fingerprint);
                inner.install(token);
                inner.events.log(
                    SecurityEvent::new(SecurityEventKind::LoginSucceeded, inner.clock.now())
                        .with("username", username),
                );
                tracing::info!("signed in");
                Ok(())
            }
            Err(error) if !error.is_rejection() => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "identity server unavailable during login"
                );
                Err(LoginError::Unavailable(error))
            }
            Err(error) => {
                inner.limiter.record_attempt(fingerprint);
                let remaining_attempts = inner.limiter.remaining_attempts(fingerprint);
                inner.events.log(
                    SecurityEvent::new(SecurityEventKind::LoginFailed, inner.clock.now())
                        .with("username", username)
                        .with("remainingAttempts", remaining_attempts)
                        .with("status", error.status()),
                );
                tracing::debug!(
                    remaining_attempts,
                    error = (&error as &dyn error::Error),
                    "login rejected"
                );
                Err(LoginError::CredentialRejected {
                    remaining_attempts,
                    source: error,
                })
            }
        }
    }

    /// Provides a fresh access token for an API call
    ///
    /// Renews the token first if it is about to expire. An expired token or
    /// a failed renewal ends the session.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotAuthenticated`] if no one is signed in.
    pub async fn access_token(&self) -> Result<AccessToken, AccessError> {
        let current = self
            .inner
            .current_token()
            .ok_or(AccessError::NotAuthenticated)?;
        self.inner.freshen(current).await
    }

    /// The persisted session, for attaching its anti-forgery token to
    /// requests
    ///
    /// # Errors
    ///
    /// Returns an error if the session store is unavailable.
    pub async fn session(&self) -> Result<Option<Session>, StorageError> {
        self.inner.guard.current().await
    }

    /// Ends the session
    ///
    /// Clears the persisted session and the held token, records the ending
    /// and tells the view layer to return to sign in. After an integrity
    /// violation a fresh session is created for the next login.
    ///
    /// Returns `false` if no one was signed in.
    pub async fn force_sign_out(&self, reason: SignOutReason) -> bool {
        self.inner.end_session(reason, None).await
    }
}

impl<C> Drop for SessionLifecycleController<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: fmt::Debug> fmt::Debug for SessionLifecycleController<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionLifecycleController")
            .field("status", &self.status())
            .field("guard", &self.inner.guard)
            .field("limiter", &self.inner.limiter)
            .field("refresh", &self.inner.refresh)
            .field("triggers", &self.inner.triggers)
            .finish_non_exhaustive()
    }
}
