//! Session and identity management
//!
//! `SessionProvider` resolves the current identity and a usable (non-expired)
//! credential. Expiry is checked against the credential's own claims, never
//! over the network, so `snapshot()` stays cheap enough to call on every sync
//! attempt. Identity transitions fan out to subscribed stores through the
//! typed `IdentityFeed` watch channel.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::id::UserId;

/// A time-bounded authorization token proving the current identity to the
/// remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCredential {
    /// The bearer token for API requests
    pub token: String,

    /// Optional refresh token for renewing access
    pub refresh_token: Option<String>,

    /// When the access token expires
    pub expires_at: DateTime<Utc>,
}

impl AuthCredential {
    pub fn new(
        token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            refresh_token,
            expires_at,
        }
    }

    /// Check if the credential is expired. Local clock only, no network.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Check if the credential should be refreshed soon (within 5 minutes of
    /// expiry).
    pub fn needs_refresh(&self) -> bool {
        let time_until_expiry = self.expires_at.signed_duration_since(Utc::now());
        time_until_expiry.num_seconds() < 300
    }
}

/// Who is signed in: a guest or a specific user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    Guest,
    User(UserId),
}

impl IdentityKind {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            IdentityKind::Guest => None,
            IdentityKind::User(id) => Some(*id),
        }
    }
}

/// Immutable view of the current session.
///
/// Invariant: a guest snapshot never carries a credential. Construction goes
/// through the two constructors below so the invariant holds by shape.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentitySnapshot {
    pub identity: IdentityKind,
    pub credential: Option<AuthCredential>,
}

impl IdentitySnapshot {
    pub fn guest() -> Self {
        Self {
            identity: IdentityKind::Guest,
            credential: None,
        }
    }

    pub fn user(user_id: UserId, credential: Option<AuthCredential>) -> Self {
        Self {
            identity: IdentityKind::User(user_id),
            credential,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self.identity, IdentityKind::Guest)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.identity.user_id()
    }
}

/// Typed publish/subscribe channel for identity transitions.
///
/// Backed by a watch channel: late subscribers immediately observe the
/// current identity, and every store reads the same snapshot value.
#[derive(Clone)]
pub struct IdentityFeed {
    tx: watch::Sender<IdentitySnapshot>,
}

impl IdentityFeed {
    pub fn new(initial: IdentitySnapshot) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<IdentitySnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> IdentitySnapshot {
        self.tx.borrow().clone()
    }

    fn publish(&self, snapshot: IdentitySnapshot) {
        let _ = self.tx.send(snapshot);
    }
}

struct AccountState {
    identity: IdentityKind,
    credential: Option<AuthCredential>,
}

/// Resolves the current identity and a usable credential.
///
/// Sign-in/sign-out transitions publish on the identity feed; credential
/// invalidation (the 401 side effect) does not, since the namespace is keyed
/// by identity, not by credential validity.
pub struct SessionProvider {
    state: RwLock<AccountState>,
    feed: IdentityFeed,
}

impl SessionProvider {
    /// Start as a guest session.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AccountState {
                identity: IdentityKind::Guest,
                credential: None,
            }),
            feed: IdentityFeed::new(IdentitySnapshot::guest()),
        }
    }

    /// The identity feed consumed by namespaced stores.
    pub fn feed(&self) -> &IdentityFeed {
        &self.feed
    }

    /// Resolve a usable session, or `None` if sync should be off.
    ///
    /// For an authenticated user with an absent or expired credential the
    /// credential is cleared (the user record kept) and `None` returned.
    /// Synchronous and side-effect-bounded: no network, no async.
    pub fn snapshot(&self) -> Option<IdentitySnapshot> {
        let mut state = self.state.write();
        match state.identity {
            IdentityKind::Guest => Some(IdentitySnapshot::guest()),
            IdentityKind::User(user_id) => match &state.credential {
                Some(credential) if !credential.is_expired() => Some(IdentitySnapshot::user(
                    user_id,
                    Some(credential.clone()),
                )),
                Some(_) => {
                    debug!(user_id = %user_id, "credential expired, clearing");
                    state.credential = None;
                    None
                }
                None => None,
            },
        }
    }

    /// The current identity regardless of credential validity. Drives
    /// namespacing even when `snapshot()` returns `None`.
    pub fn current_identity(&self) -> IdentityKind {
        self.state.read().identity
    }

    /// Sign in an authenticated user and publish the identity change.
    pub fn sign_in_user(&self, user_id: UserId, credential: AuthCredential) {
        {
            let mut state = self.state.write();
            state.identity = IdentityKind::User(user_id);
            state.credential = Some(credential.clone());
        }
        info!(user_id = %user_id, "signed in");
        self.feed
            .publish(IdentitySnapshot::user(user_id, Some(credential)));
    }

    /// Switch to (or stay in) guest mode and publish the identity change.
    pub fn continue_as_guest(&self) {
        {
            let mut state = self.state.write();
            state.identity = IdentityKind::Guest;
            state.credential = None;
        }
        info!("continuing as guest");
        self.feed.publish(IdentitySnapshot::guest());
    }

    /// Sign out back to a guest session.
    pub fn sign_out(&self) {
        self.continue_as_guest();
    }

    /// Replace the stored credential (e.g., after a refresh).
    pub fn set_credential(&self, credential: AuthCredential) {
        let mut state = self.state.write();
        state.credential = Some(credential);
    }

    /// Drop the stored credential, keeping the user record. Invoked on 401
    /// responses; the next sync attempt falls back to signed-out behavior.
    pub fn invalidate_credential(&self) {
        let mut state = self.state.write();
        if state.credential.take().is_some() {
            debug!("credential invalidated");
        }
    }
}

impl Default for SessionProvider {
    fn default() -> Self {
        Self::new()
    }
}
