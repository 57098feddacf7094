//! Core domain model, pricing estimator and clock capability for PASTO.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pasto-core";

/// Currency the estimator's figures are quoted in.
pub const CURRENCY: &str = "ARS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{label}`")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Client,
    Gardener,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Gardener => "gardener",
        }
    }
}

impl FromStr for UserRole {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "gardener" => Ok(Self::Gardener),
            other => Err(ParseLabelError {
                kind: "role",
                label: other.to_string(),
            }),
        }
    }
}

/// Already-authenticated caller of a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Actor {
    pub fn client(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: UserRole::Client,
        }
    }

    pub fn gardener(user_id: Uuid) -> Self {
        Self {
            user_id,
            role: UserRole::Gardener,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    GrassCutting,
    Pruning,
    Cleaning,
    Maintenance,
}

impl ServiceCategory {
    pub const ALL: [ServiceCategory; 4] = [
        Self::GrassCutting,
        Self::Pruning,
        Self::Cleaning,
        Self::Maintenance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GrassCutting => "grass_cutting",
            Self::Pruning => "pruning",
            Self::Cleaning => "cleaning",
            Self::Maintenance => "maintenance",
        }
    }

    pub fn base_price(self) -> f64 {
        match self {
            Self::GrassCutting => 500.0,
            Self::Pruning => 800.0,
            Self::Cleaning => 400.0,
            Self::Maintenance => 1000.0,
        }
    }

    /// Base duration in minutes.
    pub fn base_duration(self) -> f64 {
        match self {
            Self::GrassCutting => 30.0,
            Self::Pruning => 45.0,
            Self::Cleaning => 60.0,
            Self::Maintenance => 90.0,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::GrassCutting => "grass cutting",
            Self::Pruning => "pruning",
            Self::Cleaning => "cleaning",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceCategory {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseLabelError {
                kind: "service category",
                label: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningDifficulty {
    Easy,
    Medium,
    Hard,
}

impl PruningDifficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Self::Easy => 1.0,
            Self::Medium => 1.3,
            Self::Hard => 1.6,
        }
    }
}

impl FromStr for PruningDifficulty {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            other => Err(ParseLabelError {
                kind: "pruning difficulty",
                label: other.to_string(),
            }),
        }
    }
}

/// Price/duration quote for a service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub area: f64,
    pub price: f64,
    pub duration_minutes: u32,
}

/// Pure, deterministic price and duration estimate.
///
/// Every unit of area adds 1% of the category's base price and base duration.
/// Pruning is further scaled by the difficulty tier. Price is rounded to two
/// decimals; duration is truncated to whole minutes after each step.
pub fn estimate(
    category: ServiceCategory,
    width: f64,
    length: f64,
    difficulty: Option<PruningDifficulty>,
) -> Estimate {
    let area = width * length;
    let base_price = category.base_price();
    let base_duration = category.base_duration();

    let mut price = base_price + area * (base_price / 100.0);
    let mut duration = (base_duration + area * (base_duration / 100.0)).trunc();

    if category == ServiceCategory::Pruning {
        let multiplier = difficulty.map(PruningDifficulty::multiplier).unwrap_or(1.0);
        price *= multiplier;
        duration = (duration * multiplier).trunc();
    }

    Estimate {
        area,
        price: round_to(price, 2),
        duration_minutes: duration.max(0.0) as u32,
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Accepted,
    OnWay,
    InProgress,
    Completed,
    Cancelled,
}

/// How strictly the assigned gardener's status updates are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// ACCEPTED -> ON_WAY -> IN_PROGRESS -> COMPLETED, one step at a time.
    #[default]
    Strict,
    /// Any forward jump out of an assigned, non-terminal state.
    Permissive,
}

impl FromStr for TransitionPolicy {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            other => Err(ParseLabelError {
                kind: "transition policy",
                label: other.to_string(),
            }),
        }
    }
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::OnWay => "on_way",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// States in which a gardener is bound to the request and driving it.
    pub fn is_assigned_active(self) -> bool {
        matches!(self, Self::Accepted | Self::OnWay | Self::InProgress)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Accepted => 1,
            Self::OnWay => 2,
            Self::InProgress => 3,
            Self::Completed => 4,
            Self::Cancelled => 5,
        }
    }

    /// Transition table for status updates issued by the assigned gardener.
    pub fn gardener_may_advance_to(self, next: ServiceStatus, policy: TransitionPolicy) -> bool {
        if !self.is_assigned_active() {
            return false;
        }
        if next == Self::Cancelled {
            return true;
        }
        match policy {
            TransitionPolicy::Strict => matches!(
                (self, next),
                (Self::Accepted, Self::OnWay)
                    | (Self::OnWay, Self::InProgress)
                    | (Self::InProgress, Self::Completed)
            ),
            TransitionPolicy::Permissive => {
                matches!(next, Self::OnWay | Self::InProgress | Self::Completed)
                    && next.rank() > self.rank()
            }
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "on_way" => Ok(Self::OnWay),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseLabelError {
                kind: "service status",
                label: other.to_string(),
            }),
        }
    }
}

/// Client-supplied parameters of a new service request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceParams {
    pub category: ServiceCategory,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub terrain_width: f64,
    pub terrain_length: f64,
    #[serde(default)]
    pub pruning_difficulty: Option<PruningDifficulty>,
    #[serde(default)]
    pub scheduled_date: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_immediate: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// One party's score and review of the other party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRating {
    pub rating: u8,
    pub review: Option<String>,
    pub rated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Client,
    Gardener,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service_id: Uuid,
    pub client_id: Uuid,
    pub gardener_id: Option<Uuid>,
    pub category: ServiceCategory,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub terrain_width: f64,
    pub terrain_length: f64,
    pub pruning_difficulty: Option<PruningDifficulty>,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub is_immediate: bool,
    pub notes: Option<String>,
    pub images: Vec<String>,
    pub estimated_price: f64,
    pub estimated_duration: u32,
    pub final_price: Option<f64>,
    pub actual_duration: Option<u32>,
    pub status: ServiceStatus,
    pub status_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Left by the client about the gardener.
    pub rating_for_gardener: Option<PartyRating>,
    /// Left by the gardener about the client.
    pub rating_for_client: Option<PartyRating>,
}

impl ServiceRequest {
    pub fn new(client_id: Uuid, params: ServiceParams, now: DateTime<Utc>) -> Self {
        let quote = estimate(
            params.category,
            params.terrain_width,
            params.terrain_length,
            params.pruning_difficulty,
        );
        Self {
            service_id: Uuid::new_v4(),
            client_id,
            gardener_id: None,
            category: params.category,
            address: params.address,
            latitude: params.latitude,
            longitude: params.longitude,
            terrain_width: params.terrain_width,
            terrain_length: params.terrain_length,
            pruning_difficulty: params.pruning_difficulty,
            scheduled_date: params.scheduled_date,
            is_immediate: params.is_immediate,
            notes: params.notes,
            images: params.images,
            estimated_price: quote.price,
            estimated_duration: quote.duration_minutes,
            final_price: None,
            actual_duration: None,
            status: ServiceStatus::Pending,
            status_notes: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            rating_for_gardener: None,
            rating_for_client: None,
        }
    }

    /// Which side of the request `user_id` is on, if any.
    pub fn party_of(&self, user_id: Uuid) -> Option<Party> {
        if self.client_id == user_id {
            Some(Party::Client)
        } else if self.gardener_id == Some(user_id) {
            Some(Party::Gardener)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RatingSummary {
    pub average: f64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GardenerProfile {
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub coverage_areas: Vec<String>,
    pub is_available: bool,
    pub completed_jobs: u32,
}

impl Default for GardenerProfile {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            coverage_areas: Vec::new(),
            is_available: true,
            completed_jobs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub rating: RatingSummary,
    pub gardener: Option<GardenerProfile>,
}

impl User {
    pub fn new(
        email: impl Into<String>,
        full_name: impl Into<String>,
        role: UserRole,
        phone: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.into(),
            full_name: full_name.into(),
            role,
            phone,
            created_at: now,
            is_active: true,
            rating: RatingSummary::default(),
            gardener: (role == UserRole::Gardener).then(GardenerProfile::default),
        }
    }

    pub fn is_available_gardener(&self) -> bool {
        self.is_active && self.gardener.as_ref().is_some_and(|g| g.is_available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    NewServiceAvailable,
    ServiceAccepted,
    ServiceOnWay,
    ServiceInProgress,
    ServiceCompleted,
    ServiceCancelled,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewServiceAvailable => "NEW_SERVICE_AVAILABLE",
            Self::ServiceAccepted => "SERVICE_ACCEPTED",
            Self::ServiceOnWay => "SERVICE_ON_WAY",
            Self::ServiceInProgress => "SERVICE_IN_PROGRESS",
            Self::ServiceCompleted => "SERVICE_COMPLETED",
            Self::ServiceCancelled => "SERVICE_CANCELLED",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::NewServiceAvailable,
            Self::ServiceAccepted,
            Self::ServiceOnWay,
            Self::ServiceInProgress,
            Self::ServiceCompleted,
            Self::ServiceCancelled,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| ParseLabelError {
            kind: "notification kind",
            label: s.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub payload: JsonValue,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        user_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: Uuid::new_v4(),
            user_id,
            kind,
            title: title.into(),
            message: message.into(),
            payload,
            is_read: false,
            created_at: now,
        }
    }
}

/// Source of the current time for every mutation.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    /// Microsecond precision, matching what Postgres stores.
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Timestamp for a mutation of a record last touched at `previous`.
///
/// Never returns a value at or before `previous`, even if the clock stalls or
/// steps backwards.
pub fn next_timestamp(clock: &dyn Clock, previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = clock.now();
    let floor = previous + Duration::microseconds(1);
    if now < floor {
        floor
    } else {
        now
    }
}
