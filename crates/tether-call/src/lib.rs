//! tether-call - client-side call container
//!
//! A call-style invocation path built on the broker's connect/disconnect
//! primitives: callers hand in a descriptor and a completion callback, the
//! container resolves the descriptor to a cached remote handle or brings
//! the target up through the external start service, queues any number of
//! callers against one in-flight attempt, and survives remote-process
//! death by failing every queued caller and unwinding its bookkeeping.
//!
//! Whether a target is shared (singleton) or per-session is a property the
//! target reports at connect time, so records start out unindexed and
//! commit to an index only once classification arrives.
//!
//! # Runtime Requirements
//!
//! Construct the container from within a tokio runtime: death events are
//! handled through a work queue whose drain task spawns on the current
//! runtime.

pub mod callback;
pub mod container;
pub mod record;

pub use callback::CallerCallback;
pub use container::{
    CallRequest, CallerConnection, ComponentStartService, LocalCallContainer, RemoteStateListener,
};
pub use record::{Classification, LocalCallRecord};
