//! Death-notification plumbing.
//!
//! Remote handles go away without warning; both broker halves subscribe to
//! a [`DeathNotificationSource`] and react by posting work onto their own
//! queue. Recipients must never mutate subsystem state inline: the event
//! arrives on whatever thread the source fires from.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::handle::HandleIdentity;

/// Callback invoked when a remote object dies.
#[derive(Clone)]
pub struct DeathRecipient(Arc<dyn Fn(HandleIdentity) + Send + Sync>);

impl DeathRecipient {
    /// Wraps a callback. The callback should only post work elsewhere.
    pub fn new(f: impl Fn(HandleIdentity) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Delivers a death event to this recipient.
    pub fn notify(&self, identity: HandleIdentity) {
        (self.0)(identity);
    }
}

impl std::fmt::Debug for DeathRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeathRecipient")
    }
}

/// Source of remote-death events.
pub trait DeathNotificationSource: Send + Sync {
    /// Registers a recipient for every subsequent death event.
    fn subscribe(&self, recipient: DeathRecipient);
}

/// In-memory fan-out source.
///
/// Integrators bridge their transport's death callbacks into
/// [`DeathFeed::report`]; tests drive it directly.
#[derive(Default)]
pub struct DeathFeed {
    recipients: Mutex<Vec<DeathRecipient>>,
}

impl DeathFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports that the object behind `identity` died, fanning the event
    /// out to every subscriber.
    pub fn report(&self, identity: HandleIdentity) {
        let recipients = self.recipients.lock().expect("death feed poisoned").clone();
        debug!(%identity, subscribers = recipients.len(), "remote object died");
        for recipient in recipients {
            recipient.notify(identity);
        }
    }
}

impl DeathNotificationSource for DeathFeed {
    fn subscribe(&self, recipient: DeathRecipient) {
        self.recipients
            .lock()
            .expect("death feed poisoned")
            .push(recipient);
    }
}
