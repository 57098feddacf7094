//! Service lifecycle engine: request creation, acceptance, status tracking,
//! completion and bilateral rating, with the notification and rating side
//! effects each transition triggers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pasto_core::{
    estimate, next_timestamp, Actor, Clock, Estimate, Notification, Party, PartyRating,
    PruningDifficulty, ServiceCategory, ServiceParams, ServiceRequest, ServiceStatus, User,
    UserRole,
};
use pasto_notify::{DispatchError, NotificationDispatcher, PushSink};
use pasto_storage::{ServiceQuery, ServiceRepository, StoreError, Stores, UserRepository};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

mod config;
mod rating;

pub use config::EngineConfig;
pub use rating::{incremental_mean, validate_rating, RatingAggregator, MAX_RATING, MIN_RATING};

pub const CRATE_NAME: &str = "pasto-lifecycle";

const MAX_REVIEW_CHARS: usize = 2000;
const MAX_NOTES_CHARS: usize = 2000;
const MAX_IMAGES: usize = 10;
/// Longest terrain side accepted, in metres.
const MAX_TERRAIN_SIDE: f64 = 1_000.0;
/// Compare-and-swap attempts for a rating before giving up.
const MAX_RATE_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Store(_) => "store",
        }
    }
}

impl From<DispatchError> for LifecycleError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(id) => Self::NotFound(format!("notification {id}")),
            DispatchError::Store(err) => Self::Store(err),
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

/// Registration data for a new user. Credentials live with the identity
/// provider, not here.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    #[serde(default)]
    pub phone: Option<String>,
}

/// State machine over `ServiceRequest::status`.
///
/// Every transition is committed with a single compare-and-swap against the
/// service store; side effects (notifications, rating aggregation, job
/// counters) run only after that write succeeds and never undo it.
#[derive(Clone)]
pub struct LifecycleEngine {
    services: Arc<dyn ServiceRepository>,
    users: Arc<dyn UserRepository>,
    dispatcher: NotificationDispatcher,
    ratings: RatingAggregator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl LifecycleEngine {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let dispatcher = NotificationDispatcher::new(
            stores.notifications.clone(),
            stores.users.clone(),
            clock.clone(),
        )
        .with_fanout_cap(config.fanout_cap);
        Self {
            services: stores.services,
            ratings: RatingAggregator::new(stores.users.clone()),
            users: stores.users,
            dispatcher,
            clock,
            config,
        }
    }

    pub fn with_push(mut self, push: Arc<dyn PushSink>) -> Self {
        self.dispatcher = self.dispatcher.with_push(push);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn ratings(&self) -> &RatingAggregator {
        &self.ratings
    }

    /// Standalone quote for a client; the same function prices persisted
    /// requests.
    pub async fn estimate(
        &self,
        actor: &Actor,
        category: ServiceCategory,
        width: f64,
        length: f64,
        difficulty: Option<PruningDifficulty>,
    ) -> Result<Estimate> {
        self.authorize(actor, UserRole::Client, "only clients can request estimates")
            .await?;
        validate_dimensions(width, length)?;
        Ok(estimate(category, width, length, difficulty))
    }

    #[instrument(skip_all, fields(role = new_user.role.as_str()))]
    pub async fn register_user(&self, new_user: NewUser) -> Result<User> {
        let email = new_user.email.trim().to_string();
        if !email.contains('@') || email.len() < 3 {
            return Err(LifecycleError::Validation(format!("`{email}` is not an e-mail address")));
        }
        let full_name = new_user.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(LifecycleError::Validation("full_name must not be empty".into()));
        }

        let user = User::new(email, full_name, new_user.role, new_user.phone, self.clock.now());
        match self.users.insert(&user).await {
            Ok(()) => {
                info!(user_id = %user.user_id, "user registered");
                Ok(user)
            }
            Err(StoreError::Duplicate { key, .. }) => Err(LifecycleError::Conflict(format!(
                "e-mail {key} is already registered"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("user {user_id}")))
    }

    /// Gardener toggles whether new-service broadcasts reach them.
    #[instrument(skip_all, fields(gardener_id = %actor.user_id, available = available))]
    pub async fn set_availability(&self, actor: &Actor, available: bool) -> Result<User> {
        self.authorize(actor, UserRole::Gardener, "only gardeners have an availability flag")
            .await?;
        let updated = self
            .users
            .update_with(actor.user_id, &|user: &mut User| {
                if let Some(profile) = user.gardener.as_mut() {
                    profile.is_available = available;
                }
            })
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("user {}", actor.user_id)))?;
        if updated.gardener.is_none() {
            return Err(LifecycleError::Forbidden(format!(
                "user {} has no gardener profile",
                actor.user_id
            )));
        }
        Ok(updated)
    }

    /// Client creates a PENDING request priced once by the estimator, then
    /// available gardeners are told about it.
    #[instrument(skip_all, fields(client_id = %actor.user_id, category = params.category.as_str()))]
    pub async fn create_request(&self, actor: &Actor, params: ServiceParams) -> Result<ServiceRequest> {
        self.authorize(actor, UserRole::Client, "only clients can request services")
            .await?;
        validate_params(&params)?;

        let request = ServiceRequest::new(actor.user_id, params, self.clock.now());
        self.services.insert(&request).await?;
        info!(
            service_id = %request.service_id,
            estimated_price = request.estimated_price,
            estimated_duration = request.estimated_duration,
            "service request created"
        );

        match self.dispatcher.broadcast_new_service(&request).await {
            Ok(sent) => info!(service_id = %request.service_id, sent, "new service broadcast"),
            Err(err) => warn!(service_id = %request.service_id, error = %err, "new service broadcast failed"),
        }
        Ok(request)
    }

    /// A single request, visible to its parties, and to any gardener while it
    /// is still open.
    pub async fn get_request(&self, actor: &Actor, request_id: Uuid) -> Result<ServiceRequest> {
        self.verify_actor(actor).await?;
        let request = self.load(request_id).await?;
        let open_to_gardener =
            actor.role == UserRole::Gardener && request.status == ServiceStatus::Pending;
        if request.party_of(actor.user_id).is_none() && !open_to_gardener {
            return Err(LifecycleError::Forbidden(format!(
                "user {} is not a party to service {request_id}",
                actor.user_id
            )));
        }
        Ok(request)
    }

    /// Open requests any gardener may accept, newest first.
    pub async fn list_available(&self, actor: &Actor) -> Result<Vec<ServiceRequest>> {
        self.authorize(actor, UserRole::Gardener, "only gardeners can browse open services")
            .await?;
        let query = ServiceQuery::new(self.config.list_limit).status(ServiceStatus::Pending);
        Ok(self.services.query(&query).await?)
    }

    pub async fn list_by_client(&self, actor: &Actor, client_id: Uuid) -> Result<Vec<ServiceRequest>> {
        self.authorize(actor, UserRole::Client, "only clients have service requests")
            .await?;
        require_self(actor, client_id)?;
        let query = ServiceQuery::new(self.config.list_limit).client(client_id);
        Ok(self.services.query(&query).await?)
    }

    pub async fn list_by_gardener(
        &self,
        actor: &Actor,
        gardener_id: Uuid,
    ) -> Result<Vec<ServiceRequest>> {
        self.authorize(actor, UserRole::Gardener, "only gardeners have assigned jobs")
            .await?;
        require_self(actor, gardener_id)?;
        let query = ServiceQuery::new(self.config.list_limit).gardener(gardener_id);
        Ok(self.services.query(&query).await?)
    }

    /// PENDING -> ACCEPTED. First acceptance wins; later ones get Conflict.
    #[instrument(skip_all, fields(service_id = %request_id, gardener_id = %actor.user_id))]
    pub async fn accept(&self, request_id: Uuid, actor: &Actor) -> Result<ServiceRequest> {
        self.authorize(actor, UserRole::Gardener, "only gardeners can accept services")
            .await?;
        let current = self.load(request_id).await?;
        if current.client_id == actor.user_id {
            return Err(LifecycleError::Forbidden(format!(
                "user {} cannot accept their own request",
                actor.user_id
            )));
        }
        if current.status != ServiceStatus::Pending {
            return Err(LifecycleError::Conflict(format!(
                "service {request_id} is no longer available ({})",
                current.status
            )));
        }

        let mut next = current.clone();
        next.gardener_id = Some(actor.user_id);
        next.status = ServiceStatus::Accepted;
        next.updated_at = next_timestamp(self.clock.as_ref(), current.updated_at);
        self.commit(&current, &next, "service was accepted by someone else")
            .await?;
        info!("service accepted");

        self.notify_client(&next).await;
        Ok(next)
    }

    /// Status update by the assigned gardener, checked against the transition
    /// table for the configured ordering policy.
    #[instrument(skip_all, fields(service_id = %request_id, actor_id = %actor.user_id, to = new_status.as_str()))]
    pub async fn update_status(
        &self,
        request_id: Uuid,
        actor: &Actor,
        new_status: ServiceStatus,
        notes: Option<String>,
    ) -> Result<ServiceRequest> {
        if !matches!(
            new_status,
            ServiceStatus::OnWay
                | ServiceStatus::InProgress
                | ServiceStatus::Completed
                | ServiceStatus::Cancelled
        ) {
            return Err(LifecycleError::Validation(format!(
                "status `{new_status}` cannot be set by a gardener"
            )));
        }
        validate_text("notes", notes.as_deref(), MAX_NOTES_CHARS)?;
        self.authorize(actor, UserRole::Gardener, "only the assigned gardener can update a service")
            .await?;

        let current = self.load(request_id).await?;
        if actor.role != UserRole::Gardener || current.gardener_id != Some(actor.user_id) {
            return Err(LifecycleError::Forbidden(format!(
                "only the assigned gardener can update service {request_id}"
            )));
        }
        if !current
            .status
            .gardener_may_advance_to(new_status, self.config.status_order)
        {
            return Err(LifecycleError::Conflict(format!(
                "cannot move service {request_id} from {} to {new_status}",
                current.status
            )));
        }

        let now = next_timestamp(self.clock.as_ref(), current.updated_at);
        let mut next = current.clone();
        next.status = new_status;
        next.updated_at = now;
        if notes.is_some() {
            next.status_notes = notes;
        }
        match new_status {
            ServiceStatus::InProgress => next.started_at = Some(now),
            ServiceStatus::Completed => {
                next.completed_at = Some(now);
                next.final_price = Some(next.estimated_price);
                next.actual_duration = Some(match next.started_at {
                    Some(started) => whole_minutes(started, now),
                    None => next.estimated_duration,
                });
            }
            _ => {}
        }
        self.commit(&current, &next, "service changed concurrently")
            .await?;
        info!(from = current.status.as_str(), "service status updated");

        if new_status == ServiceStatus::Completed {
            if let Some(gardener_id) = next.gardener_id {
                self.count_completed_job(gardener_id).await;
            }
        }
        self.notify_client(&next).await;
        Ok(next)
    }

    /// Client withdraws a request nobody has accepted yet.
    #[instrument(skip_all, fields(service_id = %request_id, client_id = %actor.user_id))]
    pub async fn cancel(&self, request_id: Uuid, actor: &Actor) -> Result<ServiceRequest> {
        self.authorize(actor, UserRole::Client, "only clients can withdraw requests")
            .await?;
        let current = self.load(request_id).await?;
        if current.client_id != actor.user_id {
            return Err(LifecycleError::Forbidden(format!(
                "service {request_id} belongs to another client"
            )));
        }
        if current.status != ServiceStatus::Pending {
            return Err(LifecycleError::Conflict(format!(
                "service {request_id} is {} and can no longer be withdrawn",
                current.status
            )));
        }

        let mut next = current.clone();
        next.status = ServiceStatus::Cancelled;
        next.updated_at = next_timestamp(self.clock.as_ref(), current.updated_at);
        self.commit(&current, &next, "service changed concurrently")
            .await?;
        info!("service withdrawn by client");
        Ok(next)
    }

    /// One party rates the other after completion. The score lands on the
    /// rated party's side of the request and in their running average.
    #[instrument(skip_all, fields(service_id = %request_id, actor_id = %actor.user_id, rating = rating))]
    pub async fn rate(
        &self,
        request_id: Uuid,
        actor: &Actor,
        rating: u8,
        review: Option<String>,
    ) -> Result<ServiceRequest> {
        validate_rating(rating)?;
        validate_text("review", review.as_deref(), MAX_REVIEW_CHARS)?;

        // The two parties write separate slots, so a lost swap is retried
        // against the fresh record instead of surfacing as a conflict.
        let mut attempt = 0;
        let (rated_user, next) = loop {
            let current = self.load(request_id).await?;
            if current.status != ServiceStatus::Completed {
                return Err(LifecycleError::Conflict(format!(
                    "service {request_id} is {} and cannot be rated yet",
                    current.status
                )));
            }
            self.verify_actor(actor).await?;
            let party = match current.party_of(actor.user_id) {
                Some(Party::Client) if actor.role == UserRole::Client => Party::Client,
                Some(Party::Gardener) if actor.role == UserRole::Gardener => Party::Gardener,
                _ => {
                    return Err(LifecycleError::Forbidden(format!(
                        "user {} is not a party to service {request_id}",
                        actor.user_id
                    )))
                }
            };

            let now = next_timestamp(self.clock.as_ref(), current.updated_at);
            let mut next = current.clone();
            let (slot, rated_user) = match party {
                Party::Client => (&mut next.rating_for_gardener, current.gardener_id),
                Party::Gardener => (&mut next.rating_for_client, Some(current.client_id)),
            };
            if slot.is_some() && self.config.reject_repeat_ratings {
                return Err(LifecycleError::Conflict(format!(
                    "you already rated service {request_id}"
                )));
            }
            *slot = Some(PartyRating {
                rating,
                review: review.clone(),
                rated_at: now,
            });
            next.updated_at = now;
            if self.try_commit(&current, &next).await? {
                break (rated_user, next);
            }
            attempt += 1;
            if attempt >= MAX_RATE_ATTEMPTS {
                return Err(LifecycleError::Conflict(format!(
                    "service {request_id} kept changing while rating"
                )));
            }
            debug!(attempt, "rating lost a concurrent write; retrying");
        };
        info!("service rated");

        if let Some(rated_user) = rated_user {
            if let Err(err) = self.ratings.apply_rating(rated_user, rating).await {
                error!(%rated_user, error = %err, "rating stored on service but not aggregated");
            }
        }
        Ok(next)
    }

    pub async fn list_notifications(&self, user_id: Uuid) -> Result<Vec<Notification>> {
        Ok(self
            .dispatcher
            .list_for_user(user_id, self.config.list_limit)
            .await?)
    }

    pub async fn mark_notification_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
    ) -> Result<Notification> {
        Ok(self.dispatcher.mark_read(notification_id, user_id).await?)
    }

    async fn load(&self, request_id: Uuid) -> Result<ServiceRequest> {
        self.services
            .get(request_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(format!("service {request_id}")))
    }

    /// The stored user behind `actor`: it must exist, be active, hold the
    /// claimed role, and that role must be `role`.
    async fn authorize(&self, actor: &Actor, role: UserRole, message: &str) -> Result<User> {
        require_role(actor, role, message)?;
        self.verify_actor(actor).await
    }

    async fn verify_actor(&self, actor: &Actor) -> Result<User> {
        let user = self
            .users
            .get(actor.user_id)
            .await?
            .ok_or_else(|| LifecycleError::Forbidden(format!("unknown user {}", actor.user_id)))?;
        if !user.is_active || user.role != actor.role {
            return Err(LifecycleError::Forbidden(format!(
                "user {} is not an active {}",
                actor.user_id,
                actor.role.as_str()
            )));
        }
        Ok(user)
    }

    async fn try_commit(&self, current: &ServiceRequest, next: &ServiceRequest) -> Result<bool> {
        Ok(self
            .services
            .replace_if(next, current.status, current.updated_at)
            .await?)
    }

    async fn commit(
        &self,
        current: &ServiceRequest,
        next: &ServiceRequest,
        lost_race: &str,
    ) -> Result<()> {
        if self.try_commit(current, next).await? {
            Ok(())
        } else {
            Err(LifecycleError::Conflict(format!(
                "{lost_race} (service {})",
                current.service_id
            )))
        }
    }

    async fn notify_client(&self, request: &ServiceRequest) {
        if let Err(err) = self.dispatcher.notify_client_of_status(request).await {
            warn!(service_id = %request.service_id, error = %err, "client notification failed");
        }
    }

    async fn count_completed_job(&self, gardener_id: Uuid) {
        let bump = |user: &mut User| {
            if let Some(profile) = user.gardener.as_mut() {
                profile.completed_jobs = profile.completed_jobs.saturating_add(1);
            }
        };
        if let Err(err) = self.users.update_with(gardener_id, &bump).await {
            warn!(%gardener_id, error = %err, "completed job counter not updated");
        }
    }
}

fn require_role(actor: &Actor, role: UserRole, message: &str) -> Result<()> {
    if actor.role == role {
        Ok(())
    } else {
        Err(LifecycleError::Forbidden(message.to_string()))
    }
}

fn require_self(actor: &Actor, user_id: Uuid) -> Result<()> {
    if actor.user_id == user_id {
        Ok(())
    } else {
        Err(LifecycleError::Forbidden(format!(
            "user {} cannot list another user's services",
            actor.user_id
        )))
    }
}

fn whole_minutes(from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
    u32::try_from((to - from).num_minutes().max(0)).unwrap_or(u32::MAX)
}

fn validate_dimensions(width: f64, length: f64) -> Result<()> {
    for (name, value) in [("terrain_width", width), ("terrain_length", length)] {
        if !value.is_finite() || value <= 0.0 {
            return Err(LifecycleError::Validation(format!(
                "{name} must be a positive number, got {value}"
            )));
        }
        if value > MAX_TERRAIN_SIDE {
            return Err(LifecycleError::Validation(format!(
                "{name} must be at most {MAX_TERRAIN_SIDE} m, got {value}"
            )));
        }
    }
    if !(width * length).is_finite() {
        return Err(LifecycleError::Validation("terrain area is not finite".into()));
    }
    Ok(())
}

fn validate_text(field: &str, value: Option<&str>, max_chars: usize) -> Result<()> {
    match value {
        Some(text) if text.chars().count() > max_chars => Err(LifecycleError::Validation(
            format!("{field} is longer than {max_chars} characters"),
        )),
        _ => Ok(()),
    }
}

fn validate_params(params: &ServiceParams) -> Result<()> {
    validate_dimensions(params.terrain_width, params.terrain_length)?;
    if params.address.trim().is_empty() {
        return Err(LifecycleError::Validation("address must not be empty".into()));
    }
    if !(-90.0..=90.0).contains(&params.latitude) || !(-180.0..=180.0).contains(&params.longitude) {
        return Err(LifecycleError::Validation(format!(
            "coordinates ({}, {}) are out of range",
            params.latitude, params.longitude
        )));
    }
    if params.images.len() > MAX_IMAGES {
        return Err(LifecycleError::Validation(format!(
            "at most {MAX_IMAGES} images per request"
        )));
    }
    validate_text("notes", params.notes.as_deref(), MAX_NOTES_CHARS)
}
