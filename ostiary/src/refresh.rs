//! Single-flight token renewal
//!
//! The coordinator never schedules work of its own. It is driven by
//! callers asking for a fresh token, and at most one renewal is outstanding
//! at any time. Every caller that arrives while a renewal is in flight
//! receives the outcome of that same renewal.
//!
//! A failed renewal is terminal for the session. Rather than clearing any
//! state itself, the coordinator raises a [`SignOutRequest`] on the channel
//! it was constructed with and leaves the decision to its owner.

use std::{
    error,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ostiary_clock::{Clock, EpochMillis, System};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::{
    config::RefreshConfig,
    controller::SignOutReason,
    events::{SecurityEvent, SecurityEventKind, SecurityEventSink},
    remote::{RemoteError, TokenRenewer},
    token, AccessToken, AccessTokenRef, SessionId, SessionIdRef,
};

/// Why a fresh token could not be provided
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The token has already expired, or could not be decoded
    #[error("access token has expired")]
    Expired,
    /// The identity server refused or failed to renew the token
    #[error("token renewal failed")]
    RenewalFailed(#[source] RemoteError),
    /// The renewal task ended without publishing an outcome
    #[error("token renewal was abandoned before completing")]
    Abandoned,
}

/// A request, raised to the owner of the session, to end it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignOutRequest {
    /// Why the session should end
    pub reason: SignOutReason,
    /// The token that was held when the request was raised
    pub token: AccessToken,
}

type Outcome = Option<Result<AccessToken, RefreshError>>;

/// `stale` is always the token a renewal was started for. Only callers
/// still holding that token, or its replacement, may share in the result.
enum RenewalState {
    Idle,
    InFlight {
        started_at: EpochMillis,
        stale: AccessToken,
        outcome: watch::Receiver<Outcome>,
    },
    Cooldown {
        until: EpochMillis,
        stale: AccessToken,
        token: AccessToken,
    },
}

impl RenewalState {
    fn started_for(&self, current: &AccessTokenRef) -> bool {
        match self {
            RenewalState::Idle => false,
            RenewalState::InFlight { stale, .. } => stale.as_str() == current.as_str(),
            RenewalState::Cooldown { stale, token, .. } => {
                stale.as_str() == current.as_str() || token.as_str() == current.as_str()
            }
        }
    }
}

struct Inner<C> {
    renewer: Arc<dyn TokenRenewer>,
    events: Arc<dyn SecurityEventSink>,
    config: RefreshConfig,
    sign_out: mpsc::UnboundedSender<SignOutRequest>,
    state: Mutex<RenewalState>,
    clock: C,
}

impl<C> Inner<C> {
    fn state(&self) -> MutexGuard<'_, RenewalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Coordinates renewal of the access token
///
/// Cloning the coordinator yields another handle to the same renewal state.
pub struct RefreshCoordinator<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RefreshCoordinator<System> {
    /// Constructs a coordinator renewing tokens through `renewer`
    ///
    /// Sign-out requests are sent to `sign_out`.
    pub fn new(
        renewer: Arc<dyn TokenRenewer>,
        events: Arc<dyn SecurityEventSink>,
        config: RefreshConfig,
        sign_out: mpsc::UnboundedSender<SignOutRequest>,
    ) -> Self {
        Self::new_with_clock(renewer, events, config, sign_out, System)
    }
}

impl<C> RefreshCoordinator<C> {
    /// Constructs a coordinator using the given clock
    pub fn new_with_clock(
        renewer: Arc<dyn TokenRenewer>,
        events: Arc<dyn SecurityEventSink>,
        config: RefreshConfig,
        sign_out: mpsc::UnboundedSender<SignOutRequest>,
        clock: C,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                renewer,
                events,
                config,
                sign_out,
                state: Mutex::new(RenewalState::Idle),
                clock,
            }),
        }
    }

    /// Whether a renewal is currently outstanding
    pub fn is_in_flight(&self) -> bool {
        matches!(*self.inner.state(), RenewalState::InFlight { .. })
    }

    /// When the outstanding renewal started, if there is one
    pub fn in_flight_since(&self) -> Option<EpochMillis> {
        match *self.inner.state() {
            RenewalState::InFlight { started_at, .. } => Some(started_at),
            _ => None,
        }
    }
}

impl<C> RefreshCoordinator<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Provides a token that is not about to expire
    ///
    /// Returns `current` untouched while it is fresh. Once it enters the
    /// renewal threshold, a renewal is started for `session_id`, or joined
    /// if one is already outstanding for `current`. A renewal outstanding
    /// for some other token is never joined; once it settles, `current` is
    /// evaluated on its own.
    ///
    /// # Errors
    ///
    /// Returns [`RefreshError::Expired`] without contacting the identity
    /// server if `current` has already expired or cannot be decoded.
    /// Returns [`RefreshError::RenewalFailed`] when the renewal of `current`
    /// fails, in which case a sign-out request has also been raised.
    pub async fn ensure_fresh(
        &self,
        current: &AccessTokenRef,
        session_id: &SessionIdRef,
    ) -> Result<AccessToken, RefreshError> {
        loop {
            let (mut outcome, joined) = {
                let mut state = self.inner.state();
                let now = self.inner.clock.now();

                match &*state {
                    RenewalState::InFlight { outcome, .. } if state.started_for(current) => {
                        tracing::trace!("joining renewal already in flight");
                        (outcome.clone(), true)
                    }
                    RenewalState::Cooldown { until, token, .. }
                        if now < *until && state.started_for(current) =>
                    {
                        tracing::trace!(until = until.0, "handing out token renewed during cooldown");
                        return Ok(token.clone());
                    }
                    _ => {
                        if matches!(*state, RenewalState::Cooldown { .. }) {
                            *state = RenewalState::Idle;
                        }

                        if token::is_expired(current, now) {
                            tracing::debug!("token already expired, not renewing");
                            return Err(RefreshError::Expired);
                        }

                        if !token::is_expiring_soon(current, now, self.inner.config.expiring_threshold)
                        {
                            tracing::trace!("token still fresh");
                            return Ok(current.to_owned());
                        }

                        if let RenewalState::InFlight { outcome, .. } = &*state {
                            tracing::debug!(
                                "renewal in flight for a previous token, waiting for it to settle"
                            );
                            (outcome.clone(), false)
                        } else {
                            tracing::debug!("token expiring soon, starting renewal");
                            let (tx, rx) = watch::channel(None);
                            *state = RenewalState::InFlight {
                                started_at: now,
                                stale: current.to_owned(),
                                outcome: rx.clone(),
                            };
                            self.spawn_renewal(current.to_owned(), session_id.to_owned(), tx);
                            (rx, true)
                        }
                    }
                }
            };

            let result = await_outcome(&mut outcome).await;
            if joined {
                return result;
            }
        }
    }

    fn spawn_renewal(
        &self,
        stale: AccessToken,
        session_id: SessionId,
        tx: watch::Sender<Outcome>,
    ) {
        let join = tokio::spawn(renew(Arc::clone(&self.inner), stale, session_id, tx));

        tokio::spawn(async move {
            if let Err(err) = join.await {
                if err.is_panic() {
                    tracing::error!("token renewal panicked!")
                } else if err.is_cancelled() {
                    tracing::info!("token renewal was cancelled")
                }
            }
        });
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for RefreshCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = match &*self.inner.state() {
            RenewalState::Idle => "idle",
            RenewalState::InFlight { .. } => "in flight",
            RenewalState::Cooldown { .. } => "cooldown",
        };
        f.debug_struct("RefreshCoordinator")
            .field("config", &self.inner.config)
            .field("state", &state)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

async fn await_outcome(
    rx: &mut watch::Receiver<Outcome>,
) -> Result<AccessToken, RefreshError> {
    loop {
        let published = rx.borrow_and_update().clone();
        if let Some(outcome) = published {
            return outcome;
        }

        if rx.changed().await.is_err() {
            let published = rx.borrow().clone();
            return published.unwrap_or(Err(RefreshError::Abandoned));
        }
    }
}

/// Returns the coordinator to idle if the renewal task unwinds early
struct ResetOnDrop<C> {
    inner: Arc<Inner<C>>,
    armed: bool,
}

impl<C> Drop for ResetOnDrop<C> {
    fn drop(&mut self) {
        if self.armed {
            *self.inner.state() = RenewalState::Idle;
        }
    }
}

async fn renew<C: Clock>(
    inner: Arc<Inner<C>>,
    stale: AccessToken,
    session_id: SessionId,
    tx: watch::Sender<Outcome>,
) {
    let mut reset = ResetOnDrop {
        inner: Arc::clone(&inner),
        armed: true,
    };

    let result = inner.renewer.renew(&session_id).await;
    let now = inner.clock.now();

    let outcome = match result {
        Ok(token) => {
            let expires_at = token::expires_at(&token).ok();
            tracing::info!(expires_at = expires_at.map(|e| e.0), "renewed access token");
            inner.events.log(
                SecurityEvent::new(SecurityEventKind::TokenRenewed, now)
                    .with("expiresAt", expires_at.map(|e| e.0)),
            );
            Ok(token)
        }
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "token renewal failed, requesting sign-out"
            );
            inner.events.log(
                SecurityEvent::new(SecurityEventKind::TokenRenewalFailed, now)
                    .with("status", error.status()),
            );
            if inner
                .sign_out
                .send(SignOutRequest {
                    reason: SignOutReason::RenewalFailed,
                    token: stale.clone(),
                })
                .is_err()
            {
                tracing::debug!("no one is listening for sign-out requests");
            }
            Err(RefreshError::RenewalFailed(error))
        }
    };

    {
        let mut state = inner.state();
        *state = match (&outcome, inner.config.cooldown) {
            (Ok(token), Some(cooldown)) => RenewalState::Cooldown {
                until: now + cooldown,
                stale,
                token: token.clone(),
            },
            _ => RenewalState::Idle,
        };
        reset.armed = false;
        tx.send_replace(Some(outcome));
    }
}
