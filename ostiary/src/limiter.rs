//! Pre-authentication login attempt limiting
//!
//! Attempts are counted per client fingerprint rather than per identity,
//! since the limiter exists to slow down abuse before anyone has signed
//! in. Crossing the attempt threshold within the window locks the
//! fingerprint out for a fixed duration.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use base64::Engine;
use ostiary_clock::{Clock, DurationMillis, EpochMillis, System};

use crate::{
    config::RateLimitConfig,
    events::{SecurityEvent, SecurityEventKind, SecurityEventSink},
    ClientFingerprint, ClientFingerprintRef,
};

/// What the environment reveals about the client making login attempts
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientContext {
    /// The user agent string
    pub user_agent: String,
    /// The origin the console is served from
    pub origin: String,
}

impl ClientContext {
    /// Constructs a client context
    pub fn new(user_agent: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            origin: origin.into(),
        }
    }
}

/// A strategy for deriving a rate limiting key from a client
pub trait FingerprintStrategy: Send + Sync {
    /// Derives the fingerprint for `client`
    fn fingerprint(&self, client: &ClientContext) -> ClientFingerprint;
}

/// Fingerprints a client by its user agent and origin
///
/// Many users behind the same browser build and proxy share a fingerprint.
/// Swap in a different [`FingerprintStrategy`] where that is too coarse.
#[derive(Clone, Copy, Debug, Default)]
pub struct UserAgentOrigin;

impl FingerprintStrategy for UserAgentOrigin {
    fn fingerprint(&self, client: &ClientContext) -> ClientFingerprint {
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(client.user_agent.as_bytes());
        ctx.update(b"\n");
        ctx.update(client.origin.as_bytes());
        let digest = ctx.finish();
        ClientFingerprint::new(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }
}

/// Attempt bookkeeping for a single fingerprint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitRecord {
    attempts: u32,
    window_start: EpochMillis,
    locked_until: Option<EpochMillis>,
}

impl RateLimitRecord {
    fn fresh(now: EpochMillis) -> Self {
        Self {
            attempts: 0,
            window_start: now,
            locked_until: None,
        }
    }

    /// Failed attempts counted in the current window
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the current window started
    pub fn window_start(&self) -> EpochMillis {
        self.window_start
    }

    /// When the lockout ends, if one was imposed
    pub fn locked_until(&self) -> Option<EpochMillis> {
        self.locked_until
    }

    fn is_locked(&self, now: EpochMillis) -> bool {
        matches!(self.locked_until, Some(until) if now < until)
    }

    fn lockout_elapsed(&self, now: EpochMillis) -> bool {
        matches!(self.locked_until, Some(until) if now >= until)
    }

    fn window_elapsed(&self, now: EpochMillis, window: DurationMillis) -> bool {
        now - self.window_start > window
    }
}

/// Counts failed login attempts per client fingerprint
pub struct LoginRateLimiter<C = System> {
    records: Mutex<HashMap<ClientFingerprint, RateLimitRecord>>,
    config: RateLimitConfig,
    events: Arc<dyn SecurityEventSink>,
    clock: C,
}

impl LoginRateLimiter<System> {
    /// Constructs a new limiter with no recorded attempts
    pub fn new(config: RateLimitConfig, events: Arc<dyn SecurityEventSink>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            config,
            events,
            clock: System,
        }
    }
}

impl<C> LoginRateLimiter<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> LoginRateLimiter<D> {
        LoginRateLimiter {
            records: self.records,
            config: self.config,
            events: self.events,
            clock,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ClientFingerprint, RateLimitRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threshold(&self) -> u32 {
        self.config.max_attempts.max(1)
    }
}

impl<C: Clock> LoginRateLimiter<C> {
    /// Whether a login attempt from `client` may proceed
    ///
    /// Reading never counts as an attempt.
    pub fn is_allowed(&self, client: &ClientFingerprintRef) -> bool {
        let now = self.clock.now();
        !self
            .records()
            .get(client)
            .map_or(false, |r| r.is_locked(now))
    }

    /// Records a failed login attempt from `client`
    ///
    /// The whole read-modify-write happens under one lock acquisition, so
    /// attempts arriving in the same instant are never lost.
    pub fn record_attempt(&self, client: &ClientFingerprintRef) {
        let now = self.clock.now();
        let threshold = self.threshold();

        let locked_until = {
            let mut records = self.records();
            let record = records
                .entry(client.to_owned())
                .or_insert_with(|| RateLimitRecord::fresh(now));

            if !record.is_locked(now)
                && (record.lockout_elapsed(now) || record.window_elapsed(now, self.config.window))
            {
                *record = RateLimitRecord::fresh(now);
            }

            record.attempts = record.attempts.saturating_add(1);

            if record.locked_until.is_none() && record.attempts >= threshold {
                let until = now + self.config.lockout;
                record.locked_until = Some(until);
                Some((until, record.attempts))
            } else {
                tracing::debug!(
                    attempts = record.attempts,
                    threshold,
                    "recorded failed login attempt"
                );
                None
            }
        };

        if let Some((until, attempts)) = locked_until {
            tracing::warn!(
                attempts,
                locked_until = until.0,
                "login attempts exceeded threshold, locking out client"
            );
            self.events.log(
                SecurityEvent::new(SecurityEventKind::LoginRateLimited, now)
                    .with("fingerprint", client.as_str())
                    .with("attempts", attempts)
                    .with("lockedUntil", until.0),
            );
        }
    }

    /// Attempts left before `client` is locked out
    ///
    /// Zero while locked out.
    pub fn remaining_attempts(&self, client: &ClientFingerprintRef) -> u32 {
        let now = self.clock.now();
        let threshold = self.threshold();
        match self.records().get(client) {
            Some(r) if r.is_locked(now) => 0,
            Some(r) if r.lockout_elapsed(now) || r.window_elapsed(now, self.config.window) => {
                threshold
            }
            Some(r) => threshold.saturating_sub(r.attempts),
            None => threshold,
        }
    }

    /// How long until `client` may try again, if it is locked out
    pub fn lockout_remaining(&self, client: &ClientFingerprintRef) -> Option<DurationMillis> {
        let now = self.clock.now();
        self.records()
            .get(client)
            .filter(|r| r.is_locked(now))
            .and_then(|r| r.locked_until)
            .map(|until| until - now)
    }

    /// A copy of the record for `client`, if one exists
    pub fn record(&self, client: &ClientFingerprintRef) -> Option<RateLimitRecord> {
        self.records().get(client).copied()
    }

    /// Forgets everything about `client`
    ///
    /// Called once a login from `client` succeeds.
    pub fn reset(&self, client: &ClientFingerprintRef) {
        if self.records().remove(client).is_some() {
            tracing::debug!("reset login attempts after successful authentication");
        }
    }

    /// Drops records that no longer affect any decision
    ///
    /// A record expires once its window has elapsed and any lockout has
    /// ended. Returns the number of records dropped.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.window;
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, r| !(r.window_elapsed(now, window) && !r.is_locked(now)));
        let dropped = before - records.len();
        if dropped > 0 {
            tracing::trace!(dropped, "pruned expired rate limit records");
        }
        dropped
    }
}

impl<C: fmt::Debug> fmt::Debug for LoginRateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoginRateLimiter")
            .field("records", &self.records().len())
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use ostiary_clock::TestClock;

    use super::*;
    use crate::events::MemorySink;

    fn limiter() -> (LoginRateLimiter<TestClock>, TestClock, Arc<MemorySink>) {
        let clock = TestClock::new(EpochMillis(1_000_000));
        let events = Arc::new(MemorySink::new());
        let limiter =
            LoginRateLimiter::new(RateLimitConfig::default(), events.clone()).with_clock(clock.clone());
        (limiter, clock, events)
    }

    fn fp(s: &'static str) -> ClientFingerprint {
        ClientFingerprint::from_static(s)
    }

    #[test]
    fn fresh_client_has_full_allowance() {
        let (limiter, _, _) = limiter();
        assert!(limiter.is_allowed(&fp("fp1")));
        assert_eq!(limiter.remaining_attempts(&fp("fp1")), 5);
        assert_eq!(limiter.lockout_remaining(&fp("fp1")), None);
    }

    #[test]
    fn reading_does_not_count() {
        let (limiter, _, _) = limiter();
        for _ in 0..10 {
            assert!(limiter.is_allowed(&fp("fp1")));
        }
        assert_eq!(limiter.record(&fp("fp1")), None);
    }

    #[test]
    fn five_failures_in_window_lock_out() {
        let (limiter, clock, events) = limiter();
        let client = fp("fp1");

        for _ in 0..3 {
            limiter.record_attempt(&client);
            clock.advance(DurationMillis::from_secs(10));
        }
        assert!(limiter.is_allowed(&client));
        assert_eq!(limiter.remaining_attempts(&client), 2);

        limiter.record_attempt(&client);
        limiter.record_attempt(&client);

        assert!(!limiter.is_allowed(&client));
        assert_eq!(limiter.remaining_attempts(&client), 0);
        assert_eq!(
            limiter.lockout_remaining(&client),
            Some(DurationMillis::from_mins(15))
        );
        assert_eq!(events.count(SecurityEventKind::LoginRateLimited), 1);
    }

    #[test]
    fn lockout_elapses() {
        let (limiter, clock, _) = limiter();
        let client = fp("fp1");
        for _ in 0..5 {
            limiter.record_attempt(&client);
        }

        clock.advance(DurationMillis(DurationMillis::from_mins(15).0 - 1));
        assert!(!limiter.is_allowed(&client));

        clock.advance(DurationMillis(1));
        assert!(limiter.is_allowed(&client));
        assert_eq!(limiter.remaining_attempts(&client), 5);

        limiter.record_attempt(&client);
        assert_eq!(limiter.remaining_attempts(&client), 4);
    }

    #[test]
    fn attempts_while_locked_do_not_extend_the_lockout() {
        let (limiter, clock, events) = limiter();
        let client = fp("fp1");
        for _ in 0..5 {
            limiter.record_attempt(&client);
        }
        let until = limiter.record(&client).and_then(|r| r.locked_until());

        clock.advance(DurationMillis::from_mins(5));
        limiter.record_attempt(&client);

        assert_eq!(limiter.record(&client).and_then(|r| r.locked_until()), until);
        assert_eq!(events.count(SecurityEventKind::LoginRateLimited), 1);
    }

    #[test]
    fn window_elapsing_restarts_the_count() {
        let (limiter, clock, _) = limiter();
        let client = fp("fp1");
        for _ in 0..4 {
            limiter.record_attempt(&client);
        }

        clock.advance(DurationMillis::from_mins(15) + DurationMillis(1));
        assert_eq!(limiter.remaining_attempts(&client), 5);

        limiter.record_attempt(&client);
        let record = limiter.record(&client).unwrap();
        assert_eq!(record.attempts(), 1);
        assert_eq!(record.window_start(), clock.now());
        assert!(limiter.is_allowed(&client));
    }

    #[test]
    fn reset_restores_full_allowance_immediately() {
        let (limiter, _, _) = limiter();
        let client = fp("fp1");
        for _ in 0..5 {
            limiter.record_attempt(&client);
        }
        assert!(!limiter.is_allowed(&client));

        limiter.reset(&client);

        assert!(limiter.is_allowed(&client));
        assert_eq!(limiter.remaining_attempts(&client), 5);
    }

    #[test]
    fn fingerprints_are_independent() {
        let (limiter, _, _) = limiter();
        for _ in 0..5 {
            limiter.record_attempt(&fp("fp1"));
        }
        assert!(!limiter.is_allowed(&fp("fp1")));
        assert!(limiter.is_allowed(&fp("fp2")));
    }

    #[test]
    fn same_instant_attempts_are_all_counted() {
        let (limiter, _, _) = limiter();
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.record_attempt(&fp("fp1")))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(limiter.record(&fp("fp1")).unwrap().attempts(), 4);
    }

    #[test]
    fn prune_drops_only_expired_records() {
        let (limiter, clock, _) = limiter();
        for _ in 0..5 {
            limiter.record_attempt(&fp("locked"));
        }
        limiter.record_attempt(&fp("idle"));

        clock.advance(DurationMillis::from_mins(16));
        limiter.record_attempt(&fp("recent"));

        assert_eq!(limiter.prune(), 2);
        assert!(limiter.record(&fp("recent")).is_some());
        assert!(limiter.record(&fp("idle")).is_none());
        assert!(limiter.record(&fp("locked")).is_none());
    }

    #[test]
    fn user_agent_origin_fingerprints_are_stable_and_distinct() {
        let strategy = UserAgentOrigin;
        let a = ClientContext::new("Mozilla/5.0", "https://admin.example.com");
        let b = ClientContext::new("Mozilla/5.0", "https://other.example.com");

        assert_eq!(strategy.fingerprint(&a), strategy.fingerprint(&a.clone()));
        assert_ne!(strategy.fingerprint(&a), strategy.fingerprint(&b));
        assert_eq!(strategy.fingerprint(&a).as_str().len(), 43);
    }
}
