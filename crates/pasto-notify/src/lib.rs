//! Notification dispatcher: persists lifecycle notifications and fans them
//! out to gardeners, with optional best-effort webhook push.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pasto_core::{
    Clock, Notification, NotificationKind, ServiceRequest, ServiceStatus, CURRENCY,
};
use pasto_storage::{NotificationRepository, StoreError, UserRepository};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pasto-notify";

/// How many available gardeners hear about one new request.
pub const DEFAULT_FANOUT_CAP: usize = 20;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("notification {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Out-of-band delivery channel for persisted notifications.
#[async_trait]
pub trait PushSink: Send + Sync {
    async fn push(&self, notification: &Notification) -> Result<(), PushError>;
}

/// Whether a failed webhook delivery is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 4xx rejections are final except 408 and 429; 501 is final too.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        s if s.is_server_error() && s != StatusCode::NOT_IMPLEMENTED => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Delay schedule between webhook attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookPush {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl WebhookPush {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pasto-notify/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait]
impl PushSink for WebhookPush {
    async fn push(&self, notification: &Notification) -> Result<(), PushError> {
        let mut attempt = 0;
        loop {
            match self.client.post(&self.url).json(notification).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PushError::HttpStatus {
                        status: status.as_u16(),
                        url: self.url.clone(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(PushError::Request(err));
                }
            }
        }
    }
}

/// Creates notification records for lifecycle events.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifications: Arc<dyn NotificationRepository>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
    push: Option<Arc<dyn PushSink>>,
    fanout_cap: usize,
}

impl NotificationDispatcher {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        users: Arc<dyn UserRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            notifications,
            users,
            clock,
            push: None,
            fanout_cap: DEFAULT_FANOUT_CAP,
        }
    }

    pub fn with_push(mut self, push: Arc<dyn PushSink>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn with_fanout_cap(mut self, fanout_cap: usize) -> Self {
        self.fanout_cap = fanout_cap;
        self
    }

    pub fn fanout_cap(&self) -> usize {
        self.fanout_cap
    }

    /// Persist exactly one notification. Push delivery, if configured, runs
    /// on a detached task and never holds up the caller.
    pub async fn notify(
        &self,
        user_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        payload: JsonValue,
    ) -> Result<Notification, StoreError> {
        let notification = Notification::new(user_id, kind, title, message, payload, self.clock.now());
        self.notifications.insert(&notification).await?;
        debug!(
            notification_id = %notification.notification_id,
            %user_id,
            kind = kind.as_str(),
            "notification stored"
        );

        if let Some(push) = &self.push {
            let push = push.clone();
            let pending = notification.clone();
            let span = info_span!("push_notification", notification_id = %pending.notification_id);
            tokio::spawn(
                async move {
                    if let Err(err) = push.push(&pending).await {
                        warn!(error = %err, "push delivery failed");
                    }
                }
                .instrument(span),
            );
        }

        Ok(notification)
    }

    /// Tell up to `fanout_cap` available gardeners about a new request.
    /// Individual failures are logged and skipped. Returns how many were stored.
    pub async fn broadcast_new_service(&self, request: &ServiceRequest) -> Result<usize, StoreError> {
        if self.fanout_cap == 0 {
            return Ok(0);
        }
        let gardeners = self.users.available_gardeners(self.fanout_cap).await?;
        let title = "New service available";
        let message = format!(
            "New {} request at {}: estimated {} {:.2}, about {} min.",
            request.category.display_name(),
            request.address,
            CURRENCY,
            request.estimated_price,
            request.estimated_duration
        );
        let payload = service_payload(request);

        let mut sent = 0;
        for gardener in gardeners.iter().take(self.fanout_cap) {
            match self
                .notify(
                    gardener.user_id,
                    NotificationKind::NewServiceAvailable,
                    title,
                    message.clone(),
                    payload.clone(),
                )
                .await
            {
                Ok(_) => sent += 1,
                Err(err) => warn!(
                    gardener_id = %gardener.user_id,
                    service_id = %request.service_id,
                    error = %err,
                    "fan-out notification failed"
                ),
            }
        }
        Ok(sent)
    }

    /// Status-specific message to the client. `None` for statuses the client
    /// is not told about.
    pub async fn notify_client_of_status(
        &self,
        request: &ServiceRequest,
    ) -> Result<Option<Notification>, StoreError> {
        let category = request.category.display_name();
        let (kind, title, message) = match request.status {
            ServiceStatus::Accepted => (
                NotificationKind::ServiceAccepted,
                "Service accepted",
                format!("A gardener accepted your {category} request."),
            ),
            ServiceStatus::OnWay => (
                NotificationKind::ServiceOnWay,
                "Gardener on the way",
                format!("Your gardener is on the way to {}.", request.address),
            ),
            ServiceStatus::InProgress => (
                NotificationKind::ServiceInProgress,
                "Service started",
                format!("Your {category} service is in progress."),
            ),
            ServiceStatus::Completed => (
                NotificationKind::ServiceCompleted,
                "Service completed",
                format!("Your {category} service is done. Don't forget to rate your gardener."),
            ),
            ServiceStatus::Cancelled => (
                NotificationKind::ServiceCancelled,
                "Service cancelled",
                format!("Your {category} request was cancelled."),
            ),
            ServiceStatus::Pending => return Ok(None),
        };
        self.notify(request.client_id, kind, title, message, service_payload(request))
            .await
            .map(Some)
    }

    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        self.notifications.list_for_user(user_id, limit).await
    }

    /// Owner-scoped: someone else's notification is reported as missing.
    pub async fn mark_read(
        &self,
        notification_id: Uuid,
        user_id: Uuid,
    ) -> Result<Notification, DispatchError> {
        self.notifications
            .mark_read(notification_id, user_id)
            .await?
            .ok_or(DispatchError::NotFound(notification_id))
    }
}

fn service_payload(request: &ServiceRequest) -> JsonValue {
    json!({
        "service_id": request.service_id,
        "status": request.status,
        "category": request.category,
        "address": request.address,
        "estimated_price": request.estimated_price,
        "estimated_duration": request.estimated_duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pasto_core::{ManualClock, ServiceCategory, ServiceParams, User, UserRole};
    use pasto_storage::Stores;
    use tokio::sync::mpsc;

    struct ChannelPush(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl PushSink for ChannelPush {
        async fn push(&self, notification: &Notification) -> Result<(), PushError> {
            let _ = self.0.send(notification.clone());
            Ok(())
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        ))
    }

    fn dispatcher(stores: &Stores) -> NotificationDispatcher {
        NotificationDispatcher::new(stores.notifications.clone(), stores.users.clone(), clock())
    }

    fn request(client_id: Uuid) -> ServiceRequest {
        ServiceRequest::new(
            client_id,
            ServiceParams {
                category: ServiceCategory::Pruning,
                address: "Calle Falsa 123".into(),
                latitude: -34.6,
                longitude: -58.4,
                terrain_width: 10.0,
                terrain_length: 10.0,
                pruning_difficulty: None,
                scheduled_date: None,
                is_immediate: true,
                notes: None,
                images: vec![],
            },
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        )
    }

    async fn register_gardeners(stores: &Stores, n: usize) {
        for i in 0..n {
            let g = User::new(
                format!("g{i}@pasto.test"),
                format!("Gardener {i}"),
                UserRole::Gardener,
                None,
                Utc::now(),
            );
            stores.users.insert(&g).await.unwrap();
        }
    }

    #[test]
    fn default_push_schedule_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let schedule = (0..policy.max_retries)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect::<Vec<_>>();
        assert_eq!(schedule, vec![200, 400, 800, 1600]);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(2));
    }

    #[test]
    fn unavailable_receivers_are_retried_but_rejections_are_not() {
        for status in [
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert_eq!(classify_status(status), RetryDisposition::Retryable, "{status}");
        }
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::GONE,
            StatusCode::NOT_IMPLEMENTED,
        ] {
            assert_eq!(classify_status(status), RetryDisposition::NonRetryable, "{status}");
        }
    }

    #[tokio::test]
    async fn notify_persists_exactly_one_record() {
        let stores = Stores::in_memory();
        let user = Uuid::new_v4();
        let n = dispatcher(&stores)
            .notify(
                user,
                NotificationKind::ServiceAccepted,
                "t",
                "m",
                json!({"k": 1}),
            )
            .await
            .unwrap();
        assert!(!n.is_read);

        let listed = stores.notifications.list_for_user(user, 50).await.unwrap();
        assert_eq!(listed, vec![n]);
    }

    #[tokio::test]
    async fn broadcast_is_capped() {
        let stores = Stores::in_memory();
        register_gardeners(&stores, 5).await;
        let sent = dispatcher(&stores)
            .with_fanout_cap(3)
            .broadcast_new_service(&request(Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(sent, 3);
    }

    #[tokio::test]
    async fn pending_status_produces_no_client_notification() {
        let stores = Stores::in_memory();
        let out = dispatcher(&stores)
            .notify_client_of_status(&request(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn push_sink_receives_stored_notification() {
        let stores = Stores::in_memory();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = dispatcher(&stores).with_push(Arc::new(ChannelPush(tx)));

        let mut req = request(Uuid::new_v4());
        req.status = ServiceStatus::OnWay;
        let stored = dispatcher
            .notify_client_of_status(&req)
            .await
            .unwrap()
            .unwrap();

        let pushed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.notification_id, stored.notification_id);
        assert_eq!(pushed.kind, NotificationKind::ServiceOnWay);
    }

    #[tokio::test]
    async fn foreign_mark_read_is_not_found() {
        let stores = Stores::in_memory();
        let dispatcher = dispatcher(&stores);
        let owner = Uuid::new_v4();
        let n = dispatcher
            .notify(owner, NotificationKind::ServiceCompleted, "t", "m", json!({}))
            .await
            .unwrap();

        let err = dispatcher
            .mark_read(n.notification_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(id) if id == n.notification_id));
        assert!(dispatcher.mark_read(n.notification_id, owner).await.unwrap().is_read);
    }
}
