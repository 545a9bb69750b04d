//! Source of "who is this client" for a controller.

use tokio::sync::watch;

use crate::state::session::UserId;

/// Supplies the authenticated user's identifier. `None` means authentication
/// has not resolved yet; the controller defers every session operation.
pub trait UserIdProvider: Send + Sync {
    /// Identifier of the current user, if known.
    fn current_user_id(&self) -> Option<UserId>;

    /// Receiver notified when the identity changes. `None` for identities
    /// that never change.
    fn changes(&self) -> Option<watch::Receiver<Option<UserId>>> {
        None
    }
}

/// Fixed identity, mostly for tests and the demo.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticIdentity(Option<UserId>);

impl StaticIdentity {
    /// Identity that is always `user_id`.
    pub fn new(user_id: UserId) -> Self {
        Self(Some(user_id))
    }

    /// Identity that never resolves.
    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl UserIdProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        self.0
    }
}

/// Identity fed by an authentication flow through a `watch` channel.
#[derive(Debug, Clone)]
pub struct WatchIdentity {
    receiver: watch::Receiver<Option<UserId>>,
}

/// Writer side of a [`WatchIdentity`].
#[derive(Debug)]
pub struct IdentityHandle {
    sender: watch::Sender<Option<UserId>>,
}

impl WatchIdentity {
    /// Unresolved identity together with the handle that resolves it.
    pub fn channel() -> (IdentityHandle, WatchIdentity) {
        let (sender, receiver) = watch::channel(None);
        (IdentityHandle { sender }, WatchIdentity { receiver })
    }
}

impl UserIdProvider for WatchIdentity {
    fn current_user_id(&self) -> Option<UserId> {
        *self.receiver.borrow()
    }

    fn changes(&self) -> Option<watch::Receiver<Option<UserId>>> {
        Some(self.receiver.clone())
    }
}

impl IdentityHandle {
    /// Authentication resolved to `user_id`.
    pub fn sign_in(&self, user_id: UserId) {
        self.sender.send_replace(Some(user_id));
    }

    /// Forget the current user.
    pub fn sign_out(&self) {
        self.sender.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn watch_identity_follows_sign_in() {
        let (handle, identity) = WatchIdentity::channel();
        assert_eq!(identity.current_user_id(), None);

        let user = Uuid::new_v4();
        handle.sign_in(user);
        assert_eq!(identity.current_user_id(), Some(user));

        handle.sign_out();
        assert_eq!(identity.current_user_id(), None);
    }

    #[tokio::test]
    async fn changes_notify_on_sign_in() {
        let (handle, identity) = WatchIdentity::channel();
        let mut changes = identity.changes().unwrap();
        assert!(StaticIdentity::anonymous().changes().is_none());

        let user = Uuid::new_v4();
        handle.sign_in(user);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), Some(user));
    }

    #[test]
    fn anonymous_identity_never_resolves() {
        assert_eq!(StaticIdentity::anonymous().current_user_id(), None);
        let user = Uuid::new_v4();
        assert_eq!(StaticIdentity::new(user).current_user_id(), Some(user));
    }
}
