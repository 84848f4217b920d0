//! Tunables for the session lifecycle
//!
//! Every configuration type has a [`Default`] describing the recommended
//! behaviour and can be deserialized from JSON, with missing fields taking
//! their default values.

use ostiary_clock::DurationMillis;
use serde::Deserialize;

use crate::token::DEFAULT_EXPIRING_THRESHOLD;

/// Configuration for proactive token renewal
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefreshConfig {
    pub(crate) expiring_threshold: DurationMillis,
    pub(crate) cooldown: Option<DurationMillis>,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Tokens are renewed once they expire within 5 minutes. No cooldown is
    /// applied after a successful renewal.
    fn default() -> Self {
        Self {
            expiring_threshold: DEFAULT_EXPIRING_THRESHOLD,
            cooldown: None,
        }
    }
}

impl RefreshConfig {
    /// Constructs a refresh configuration renewing tokens that expire
    /// within `expiring_threshold`
    pub fn new(expiring_threshold: DurationMillis) -> Self {
        Self {
            expiring_threshold,
            cooldown: None,
        }
    }

    /// After a successful renewal, hand out the renewed token for
    /// `cooldown` without consulting the authority again
    pub fn with_cooldown(mut self, cooldown: DurationMillis) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// The renewal threshold
    pub fn expiring_threshold(&self) -> DurationMillis {
        self.expiring_threshold
    }
}

/// Configuration for environment signal handling
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TriggerConfig {
    pub(crate) tick_interval: DurationMillis,
    pub(crate) dedup_window: DurationMillis,
}

impl Default for TriggerConfig {
    /// Default trigger configuration
    ///
    /// Ticks every 30 seconds and collapses rechecks arriving within one
    /// second of each other.
    fn default() -> Self {
        Self {
            tick_interval: DurationMillis::from_secs(30),
            dedup_window: DurationMillis::from_secs(1),
        }
    }
}

impl TriggerConfig {
    /// Constructs a trigger configuration
    pub fn new(tick_interval: DurationMillis, dedup_window: DurationMillis) -> Self {
        Self {
            tick_interval,
            dedup_window,
        }
    }
}

/// Configuration for login attempt rate limiting
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub(crate) max_attempts: u32,
    pub(crate) window: DurationMillis,
    pub(crate) lockout: DurationMillis,
}

impl Default for RateLimitConfig {
    /// Default rate limit configuration
    ///
    /// Five failed attempts within 15 minutes lock the client out for
    /// 15 minutes.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: DurationMillis::from_mins(15),
            lockout: DurationMillis::from_mins(15),
        }
    }
}

impl RateLimitConfig {
    /// Constructs a rate limit configuration
    ///
    /// `max_attempts` failures within `window` lock the client out for
    /// `lockout`.
    pub fn new(max_attempts: u32, window: DurationMillis, lockout: DurationMillis) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
            lockout,
        }
    }

    /// The number of attempts allowed within a window
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Configuration for the persisted session record
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub(crate) storage_key: String,
    pub(crate) session_id_len: usize,
}

/// Session identifiers shorter than this never pass the format check
pub const MIN_SESSION_ID_LEN: usize = 20;

impl Default for SessionConfig {
    /// Default session configuration
    ///
    /// Stores the record under `ostiary.session` with 32-character
    /// identifiers.
    fn default() -> Self {
        Self {
            storage_key: "ostiary.session".to_owned(),
            session_id_len: 32,
        }
    }
}

impl SessionConfig {
    /// Constructs a session configuration
    ///
    /// Identifier lengths below the format minimum are raised to it.
    pub fn new(storage_key: impl Into<String>, session_id_len: usize) -> Self {
        Self {
            storage_key: storage_key.into(),
            session_id_len: session_id_len.max(MIN_SESSION_ID_LEN),
        }
    }

    /// The storage key of the session record
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// The length of generated session identifiers
    ///
    /// Never below [`MIN_SESSION_ID_LEN`], however the configuration was
    /// obtained.
    pub fn session_id_len(&self) -> usize {
        self.session_id_len.max(MIN_SESSION_ID_LEN)
    }
}

/// Configuration for the whole session lifecycle
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LifecycleConfig {
    pub(crate) refresh: RefreshConfig,
    pub(crate) triggers: TriggerConfig,
    pub(crate) rate_limit: RateLimitConfig,
    pub(crate) session: SessionConfig,
    pub(crate) expiry_warning: Option<DurationMillis>,
}

impl LifecycleConfig {
    /// Replaces the refresh configuration
    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    /// Replaces the trigger configuration
    pub fn with_triggers(mut self, triggers: TriggerConfig) -> Self {
        self.triggers = triggers;
        self
    }

    /// Replaces the rate limit configuration
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Replaces the session configuration
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Starts warning the user this long before the token expires
    ///
    /// Defaults to 2 minutes.
    pub fn with_expiry_warning(mut self, lead: DurationMillis) -> Self {
        self.expiry_warning = Some(lead);
        self
    }

    pub(crate) fn expiry_warning_lead(&self) -> DurationMillis {
        self.expiry_warning
            .unwrap_or(DurationMillis::from_mins(2))
    }
}
