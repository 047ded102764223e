//! Identity and sign-in state
//!
//! The signed-in user and bearer token live in a [`CredentialStore`] under
//! fixed keys. [`IdentityContext`] is handed to the orchestrator at
//! construction; nothing reads the store through globals.

pub mod callback;
pub mod store;

pub use callback::{parse_auth_callback, sign_in_url};
pub use store::{
    CredentialStore, FileCredentialStore, MemoryCredentialStore, ONBOARDED_KEY, TOKEN_KEY,
    USER_KEY,
};

use crate::{BriefError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Signed-in user as returned by the identity provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            name: None,
            picture: None,
        }
    }
}

/// Token plus the user it belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub user: UserProfile,
}

/// Identity collaborator passed into the orchestrator
#[derive(Clone)]
pub struct IdentityContext {
    store: Arc<dyn CredentialStore>,
}

impl IdentityContext {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Context backed by a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStore::new()))
    }

    /// Load stored credentials; both user and token must be present
    pub fn load(&self) -> Result<Option<Credentials>> {
        let user = self.store.load(USER_KEY)?;
        let token = self.store.load(TOKEN_KEY)?;

        match (user, token) {
            (Some(user), Some(token)) => {
                let user: UserProfile = serde_json::from_str(&user).map_err(|e| {
                    BriefError::StorageError(format!("Stored user is invalid: {}", e))
                })?;
                Ok(Some(Credentials { token, user }))
            }
            _ => Ok(None),
        }
    }

    /// Persist credentials and mark onboarding complete
    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        let user = serde_json::to_string(&credentials.user)?;
        self.store.save(TOKEN_KEY, &credentials.token)?;
        self.store.save(USER_KEY, &user)?;
        self.store.save(ONBOARDED_KEY, "true")?;
        info!("Signed in as {}", credentials.user.email);
        Ok(())
    }

    /// Persist the payload of a sign-in redirect, if it has one
    pub fn accept_callback(&self, url: &str) -> Result<Option<UserProfile>> {
        match parse_auth_callback(url)? {
            Some(credentials) => {
                self.save(&credentials)?;
                Ok(Some(credentials.user))
            }
            None => Ok(None),
        }
    }

    /// Forget the signed-in user
    pub fn sign_out(&self) -> Result<()> {
        self.store.remove(TOKEN_KEY)?;
        self.store.remove(USER_KEY)?;
        self.store.remove(ONBOARDED_KEY)?;
        info!("Signed out");
        Ok(())
    }

    /// Current user, if signed in; unreadable storage counts as signed out
    pub fn current_user(&self) -> Option<UserProfile> {
        match self.load() {
            Ok(credentials) => credentials.map(|c| c.user),
            Err(e) => {
                warn!("Failed to load credentials: {}", e);
                None
            }
        }
    }

    pub fn token(&self) -> Option<String> {
        self.store.load(TOKEN_KEY).ok().flatten()
    }

    pub fn is_onboarded(&self) -> bool {
        matches!(self.store.load(ONBOARDED_KEY), Ok(Some(v)) if v == "true")
    }
}

impl std::fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityContext").finish_non_exhaustive()
    }
}
