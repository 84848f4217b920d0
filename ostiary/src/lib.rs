//! Client-side session and access token lifecycle management
//!
//! This library keeps a signed-in client's access token fresh, guards the
//! client-persisted session record against tampering, and slows down
//! repeated failed logins before anyone has authenticated.
//!
//! Everything is driven from a single [`SessionLifecycleController`]. It is
//! built once per application instance and owns every other component:
//!
//! * [`token`] inspects the expiry of compact bearer tokens without
//!   verifying them.
//! * [`SessionIntegrityGuard`] validates and regenerates the persisted
//!   session record through a [`SessionStore`][store::SessionStore].
//! * [`LoginRateLimiter`] counts failed logins per client fingerprint and
//!   locks the client out once a threshold is crossed.
//! * [`RefreshCoordinator`] renews tokens that are about to expire, with at
//!   most one renewal outstanding at a time.
//! * [`TriggerMultiplexer`] funnels focus, visibility, connectivity and
//!   periodic signals into rechecks of the session.
//! * [`events`] carries security events to an audit destination.
//!
//! Only the controller ever clears authenticated state. Every other
//! component signals its intent to sign out and leaves the decision there.
//!
//! # General Flow
//!
//! On application start-up, construct the remote collaborators and the
//! session store, then build and start the controller. Environment adapters
//! forward signals to it, and API callers ask it for a token before each
//! request.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ostiary::{
//!     events::TracingSink,
//!     limiter::ClientContext,
//!     remote::{Credentials, HttpCredentialExchange, HttpTokenRenewer},
//!     store::FileSessionStore,
//!     LifecycleConfig, Password, SessionLifecycleController, Signal, Username,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = reqwest::Client::new();
//! let renewer = HttpTokenRenewer::new(
//!     client.clone(),
//!     reqwest::Url::parse("https://id.example.com/session/renew")?,
//! );
//! let exchange = HttpCredentialExchange::new(
//!     client,
//!     reqwest::Url::parse("https://id.example.com/session/login")?,
//! );
//! let store = FileSessionStore::new(std::path::PathBuf::from(".ostiary"));
//!
//! let controller = SessionLifecycleController::builder(
//!     Arc::new(renewer),
//!     Arc::new(exchange),
//!     Arc::new(store),
//! )
//! .with_config(LifecycleConfig::default())
//! .with_event_sink(Arc::new(TracingSink))
//! .with_client(ClientContext::new("console/1.0", "https://admin.example.com"))
//! .build();
//!
//! controller.start().await?;
//!
//! controller
//!     .login(&Credentials::new(
//!         Username::from_static("alice@example.com"),
//!         Password::from_static("correct horse battery staple"),
//!     ))
//!     .await?;
//!
//! controller.signal(Signal::FocusGained);
//!
//! let token = controller.access_token().await?;
//! tracing::info!(token = format_args!("{:#?}", token), "calling the API");
//!
//! controller.stop();
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes a console demo in the examples folder that drives the
//! controller interactively. Refer to it for more details on usage.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `http`: Provides `reqwest` implementations of the renewal and credential exchange
//!   calls, and a security event sink that ships events to a collector.
//! * `file`: Provides a session store that persists the session record on the local
//!   filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod anomaly;
mod braids;
pub mod config;
pub mod controller;
pub mod events;
pub mod integrity;
pub mod limiter;
pub mod refresh;
pub mod remote;
pub mod store;
pub mod token;
pub mod triggers;

pub use braids::*;
pub use config::LifecycleConfig;
pub use controller::{
    AccessError, LoginError, SessionLifecycleBuilder, SessionLifecycleController, SessionStatus,
    SignOutReason,
};
pub use integrity::{Session, SessionIntegrityGuard};
pub use limiter::LoginRateLimiter;
pub use refresh::{RefreshCoordinator, RefreshError};
pub use token::TokenStatus;
pub use triggers::{Signal, TriggerMultiplexer};
