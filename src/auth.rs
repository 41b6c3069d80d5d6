//! Session user resolution through the instance cache
//!
//! Loads the logged-in user from the cache on every request instead of the
//! store. Anything that goes wrong on the cached path, from a malformed
//! session to a backend outage, defers to the caller's own resolver.

use std::future::Future;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::entity::Instance;
use crate::model_cache::CachedModel;

/// Session entry holding the authenticated user's primary key
pub const SESSION_USER_KEY: &str = "_auth_user_id";

/// Sessions store the id as a string, older ones as a number.
#[derive(Deserialize)]
#[serde(untagged)]
enum SessionUserId {
    Int(i64),
    Text(String),
}

impl SessionUserId {
    fn parse(value: &Value) -> Option<i64> {
        match Self::deserialize(value).ok()? {
            Self::Int(id) => Some(id),
            Self::Text(id) => id.trim().parse().ok(),
        }
    }
}

#[derive(Clone)]
pub struct CachedAuthentication {
    users: CachedModel,
}

impl CachedAuthentication {
    /// `users` is the gateway of the user type.
    pub fn new(users: CachedModel) -> Self {
        Self { users }
    }

    /// Resolve the session's user from the cache, or through `fallback` when
    /// that is not possible. `None` means an anonymous request.
    pub async fn user<F, Fut>(&self, session: &Map<String, Value>, fallback: F) -> Option<Instance>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Instance>>,
    {
        let Some(id) = session.get(SESSION_USER_KEY).and_then(SessionUserId::parse) else {
            debug!("No usable user id in session, using fallback resolver");
            return fallback().await;
        };

        match self.users.get(id).await {
            Ok(user) => Some(user),
            Err(e) => {
                if e.is_not_found() {
                    debug!("Session user {} does not exist", id);
                } else {
                    warn!("Cached user lookup failed for {}: {}", id, e);
                }
                fallback().await
            }
        }
    }
}
