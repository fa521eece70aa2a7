//! Read-through user cache in front of an [`EntityLookup`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::http::EntityLookup;
use crate::model::{Snowflake, User};

pub struct Cache {
    enabled: bool,
    lookup: Arc<dyn EntityLookup>,
    users: RwLock<HashMap<Snowflake, User>>,
    current_user: RwLock<Option<Snowflake>>,
}

impl Cache {
    /// With `enabled` false every call goes straight to `lookup`.
    pub fn new(lookup: Arc<dyn EntityLookup>, enabled: bool) -> Self {
        Self {
            enabled,
            lookup,
            users: RwLock::new(HashMap::new()),
            current_user: RwLock::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn current_user(&self) -> Result<User> {
        if self.enabled {
            let id = *self.current_user.read().await;
            if let Some(id) = id {
                if let Some(user) = self.users.read().await.get(&id) {
                    return Ok(user.clone());
                }
            }
        }

        let user = self.lookup.current_user().await?;
        self.set_current_user(user.clone()).await;
        Ok(user)
    }

    /// Fed from READY so most lookups never hit the network.
    pub async fn set_current_user(&self, user: User) {
        if !self.enabled {
            return;
        }
        *self.current_user.write().await = Some(user.id);
        self.users.write().await.insert(user.id, user);
    }

    /// Cached copy only; never goes to the network.
    pub async fn user(&self, id: Snowflake) -> Option<User> {
        if !self.enabled {
            return None;
        }
        self.users.read().await.get(&id).cloned()
    }
}
