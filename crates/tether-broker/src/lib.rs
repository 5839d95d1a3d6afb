//! tether-broker - server-side connection manager
//!
//! This crate tracks every loaded-or-loading target instance, multiplexes
//! caller connection requests onto one instance each, drives instances
//! through the start/connect/command/disconnect/terminate lifecycle,
//! detects stuck transitions with per-step timers, and reclaims state when
//! a target or caller dies.
//!
//! The manager serializes every mutation behind one lock; lifecycle work is
//! handed to an external [`dispatch::LifecycleDispatcher`] and answered
//! through the `*_done` entry points. Death notifications and deferred
//! completions arrive through a work queue, never inline on the thread that
//! observed them.
//!
//! # Runtime Requirements
//!
//! Construct the manager from within a tokio runtime: the work queue and
//! the timeout timers spawn tasks on the current runtime.

pub mod connection;
pub mod dispatch;
pub mod manager;
pub mod target;
pub mod timeout;

pub use connection::ConnectionRecord;
pub use dispatch::{DispatchOp, LifecycleDispatcher, TargetSnapshot};
pub use manager::{ConnectionManager, ManagerConfig, RunningInfo, TargetRequest};
pub use target::TargetRecord;
pub use timeout::{TimeoutKind, TimeoutScheduler};
