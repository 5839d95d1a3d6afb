//! tether-core - shared types for the tether connection broker
//!
//! This crate holds the leaf types both halves of the broker depend on:
//! component descriptors, lifecycle and connection state machines, opaque
//! remote handles with stable identity, death-notification plumbing, the
//! serialized work queue, restart policy, timeout configuration, and the
//! error taxonomy. It is intentionally free of broker logic so that the
//! server side (`tether-broker`) and the client side (`tether-call`) can
//! evolve against a small, stable vocabulary.
//!
//! # Modules
//!
//! - [`config`]: lifecycle timeout windows
//! - [`death`]: death-notification source, recipients, and test feed
//! - [`descriptor`]: component descriptors and canonical keys
//! - [`error`]: broker- and call-side error enums
//! - [`handle`]: remote/scheduler handles, tokens, id generators
//! - [`lifecycle`]: target and connection state machines
//! - [`observer`]: connection observer callbacks and launch classification
//! - [`queue`]: the serialized work queue
//! - [`restart`]: keep-alive restart policy (window, breaker, backoff)
//! - [`session`]: session identifiers and the session resolver seam

pub mod config;
pub mod death;
pub mod descriptor;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod observer;
pub mod queue;
pub mod restart;
pub mod session;

pub use config::TimeoutConfig;
pub use death::{DeathFeed, DeathNotificationSource, DeathRecipient};
pub use descriptor::Descriptor;
pub use error::{BrokerError, CallError};
pub use handle::{CallerToken, HandleIdentity, RemoteHandle, SchedulerHandle, TargetToken};
pub use lifecycle::{ConnectionState, LifecycleState};
pub use observer::{ConnectionObserver, DisconnectReason, LaunchClass};
pub use queue::WorkQueue;
pub use restart::{BackoffConfig, RestartConfig, RestartManager};
pub use session::{SessionId, SessionResolver};
