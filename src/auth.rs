//! Authentication and policy collaborators
//!
//! The negotiator only sees the [`Authenticator`] and [`PolicyProvider`]
//! traits. The config-backed implementations below are what the bundled
//! binary uses; an embedding application can plug in RADIUS, LDAP or a
//! database instead.

use crate::config::Config;
use crate::crypto::verify_password;
use crate::policy::GroupPolicy;
use crate::protocol::Credential;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Authenticated user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub group: String,
}

/// Why a credential was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("invalid username or password")]
    BadCredentials,
    #[error("account disabled")]
    Disabled,
    #[error("account expired")]
    Expired,
    #[error("authentication backend unavailable: {0}")]
    Unavailable(String),
}

/// Verifies client credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &Credential) -> Result<Identity, AuthRejection>;
}

/// Resolves a group name into its policy
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn group_policy(&self, group: &str) -> Option<GroupPolicy>;
}

#[derive(Debug, Clone)]
struct LocalUser {
    password_hash: String,
    group: String,
    disabled: bool,
    expires_at: Option<u64>,
}

/// Users from the `[[users]]` config section
#[derive(Debug, Default)]
pub struct LocalAuthenticator {
    users: RwLock<HashMap<String, LocalUser>>,
}

impl LocalAuthenticator {
    pub fn from_config(config: &Config) -> Self {
        let auth = Self::default();
        auth.reload(config);
        auth
    }

    /// Replace the user table
    pub fn reload(&self, config: &Config) {
        let users = config
            .users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    LocalUser {
                        password_hash: u.password_hash.clone(),
                        group: u.group.clone(),
                        disabled: u.disabled,
                        expires_at: u.expires_at,
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        log::info!("Loaded {} local users", users.len());
        *self.users.write() = users;
    }
}

#[async_trait]
impl Authenticator for LocalAuthenticator {
    async fn authenticate(&self, credential: &Credential) -> Result<Identity, AuthRejection> {
        let Credential::Password { username, password } = credential;
        let Some(user) = self.users.read().get(username).cloned() else {
            return Err(AuthRejection::BadCredentials);
        };
        if !verify_password(password, &user.password_hash) {
            return Err(AuthRejection::BadCredentials);
        }
        if user.disabled {
            return Err(AuthRejection::Disabled);
        }
        if let Some(expires_at) = user.expires_at {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if now >= expires_at {
                return Err(AuthRejection::Expired);
            }
        }
        Ok(Identity {
            username: username.clone(),
            group: user.group,
        })
    }
}

/// Group policies from the `[[groups]]` config section
#[derive(Debug, Default)]
pub struct StaticPolicyProvider {
    groups: RwLock<HashMap<String, GroupPolicy>>,
}

impl StaticPolicyProvider {
    pub fn from_config(config: &Config) -> Self {
        let provider = Self::default();
        provider.reload(config);
        provider
    }

    pub fn reload(&self, config: &Config) {
        let groups = config
            .groups
            .iter()
            .map(|g| (g.name.clone(), GroupPolicy::from_config(g, config)))
            .collect::<HashMap<_, _>>();
        *self.groups.write() = groups;
    }
}

#[async_trait]
impl PolicyProvider for StaticPolicyProvider {
    async fn group_policy(&self, group: &str) -> Option<GroupPolicy> {
        self.groups.read().get(group).cloned()
    }
}
