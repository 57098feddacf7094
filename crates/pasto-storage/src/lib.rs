//! Repository contracts for PASTO entities plus in-memory and Postgres stores.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pasto_core::{Notification, ServiceRequest, ServiceStatus, User};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod postgres;

pub use postgres::PgStore;

pub const CRATE_NAME: &str = "pasto-storage";

/// Upper bound on any range query, whatever the caller asks for.
pub const MAX_QUERY_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("corrupt {entity} row: {reason}")]
    Corrupt { entity: &'static str, reason: String },
}

/// Filtered, newest-first range query over service requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceQuery {
    pub client_id: Option<Uuid>,
    pub gardener_id: Option<Uuid>,
    pub status: Option<ServiceStatus>,
    pub limit: usize,
}

impl ServiceQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            client_id: None,
            gardener_id: None,
            status: None,
            limit,
        }
    }

    pub fn client(mut self, client_id: Uuid) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn gardener(mut self, gardener_id: Uuid) -> Self {
        self.gardener_id = Some(gardener_id);
        self
    }

    pub fn status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn matches(&self, request: &ServiceRequest) -> bool {
        self.client_id.map_or(true, |id| request.client_id == id)
            && self.gardener_id.map_or(true, |id| request.gardener_id == Some(id))
            && self.status.map_or(true, |s| request.status == s)
    }
}

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    async fn insert(&self, request: &ServiceRequest) -> Result<(), StoreError>;

    async fn get(&self, service_id: Uuid) -> Result<Option<ServiceRequest>, StoreError>;

    async fn query(&self, query: &ServiceQuery) -> Result<Vec<ServiceRequest>, StoreError>;

    /// Atomically replace the stored record with `updated`, but only if the
    /// stored record still has `expected_status` and `expected_updated_at`.
    ///
    /// Returns `false` (and changes nothing) when the guard does not hold or
    /// the record is gone.
    async fn replace_if(
        &self,
        updated: &ServiceRequest,
        expected_status: ServiceStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

pub type UserMutation<'a> = &'a (dyn Fn(&mut User) + Send + Sync);

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `StoreError::Duplicate` if the e-mail is already registered.
    async fn insert(&self, user: &User) -> Result<(), StoreError>;

    async fn get(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    /// Active gardeners flagged available, oldest registration first.
    async fn available_gardeners(&self, limit: usize) -> Result<Vec<User>, StoreError>;

    /// Read-modify-write of one user under a row lock. `None` if missing.
    async fn update_with(
        &self,
        user_id: Uuid,
        mutation: UserMutation<'_>,
    ) -> Result<Option<User>, StoreError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Flip the read flag. `None` unless the notification exists and belongs
    /// to `owner`.
    async fn mark_read(
        &self,
        notification_id: Uuid,
        owner: Uuid,
    ) -> Result<Option<Notification>, StoreError>;
}

/// The three repositories the lifecycle engine is wired against.
#[derive(Clone)]
pub struct Stores {
    pub services: Arc<dyn ServiceRepository>,
    pub users: Arc<dyn UserRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::default());
        Self {
            services: store.clone(),
            users: store.clone(),
            notifications: store,
        }
    }

    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            services: store.clone(),
            users: store.clone(),
            notifications: store,
        }
    }

    /// Postgres when a database URL is given, in-memory otherwise.
    pub async fn from_database_url(database_url: Option<&str>) -> anyhow::Result<Self> {
        match database_url {
            Some(url) => {
                let store = PgStore::connect(url)
                    .await
                    .context("connecting to postgres")?;
                Ok(Self::postgres(store))
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using the in-memory store");
                Ok(Self::in_memory())
            }
        }
    }
}

/// Process-local store. Each collection sits behind its own mutex, which
/// makes every trait method atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    services: Mutex<HashMap<Uuid, ServiceRequest>>,
    users: Mutex<HashMap<Uuid, User>>,
    notifications: Mutex<Vec<Notification>>,
}

#[async_trait]
impl ServiceRepository for MemoryStore {
    async fn insert(&self, request: &ServiceRequest) -> Result<(), StoreError> {
        let mut services = self.services.lock().await;
        if services.contains_key(&request.service_id) {
            return Err(StoreError::Duplicate {
                entity: "service request",
                key: request.service_id.to_string(),
            });
        }
        services.insert(request.service_id, request.clone());
        Ok(())
    }

    async fn get(&self, service_id: Uuid) -> Result<Option<ServiceRequest>, StoreError> {
        Ok(self.services.lock().await.get(&service_id).cloned())
    }

    async fn query(&self, query: &ServiceQuery) -> Result<Vec<ServiceRequest>, StoreError> {
        let services = self.services.lock().await;
        let mut rows = services
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(query.effective_limit());
        Ok(rows)
    }

    async fn replace_if(
        &self,
        updated: &ServiceRequest,
        expected_status: ServiceStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut services = self.services.lock().await;
        match services.get_mut(&updated.service_id) {
            Some(current)
                if current.status == expected_status
                    && current.updated_at == expected_updated_at =>
            {
                *current = updated.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        if users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(StoreError::Duplicate {
                entity: "user",
                key: user.email.clone(),
            });
        }
        users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().await.get(&user_id).cloned())
    }

    async fn available_gardeners(&self, limit: usize) -> Result<Vec<User>, StoreError> {
        let users = self.users.lock().await;
        let mut rows = users
            .values()
            .filter(|u| u.is_available_gardener())
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        rows.truncate(limit.min(MAX_QUERY_LIMIT));
        Ok(rows)
    }

    async fn update_with(
        &self,
        user_id: Uuid,
        mutation: UserMutation<'_>,
    ) -> Result<Option<User>, StoreError> {
        let mut users = self.users.lock().await;
        Ok(users.get_mut(&user_id).map(|user| {
            mutation(user);
            user.clone()
        }))
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
        self.notifications.lock().await.push(notification.clone());
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let notifications = self.notifications.lock().await;
        let mut rows = notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        // Stable sort keeps insertion order among equal timestamps; reverse it.
        rows.reverse();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.clamp(1, MAX_QUERY_LIMIT));
        Ok(rows)
    }

    async fn mark_read(
        &self,
        notification_id: Uuid,
        owner: Uuid,
    ) -> Result<Option<Notification>, StoreError> {
        let mut notifications = self.notifications.lock().await;
        Ok(notifications
            .iter_mut()
            .find(|n| n.notification_id == notification_id && n.user_id == owner)
            .map(|n| {
                n.is_read = true;
                n.clone()
            }))
    }
}
