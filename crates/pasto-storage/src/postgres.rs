use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pasto_core::{
    GardenerProfile, Notification, ParseLabelError, PartyRating, RatingSummary, ServiceRequest,
    ServiceStatus, User,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    NotificationRepository, ServiceQuery, ServiceRepository, StoreError, UserMutation,
    UserRepository, MAX_QUERY_LIMIT,
};

const SERVICE_COLUMNS: &str = r#"
    SELECT service_id, client_id, gardener_id, category, address, latitude, longitude,
           terrain_width, terrain_length, pruning_difficulty, scheduled_date, is_immediate,
           notes, images, estimated_price, estimated_duration, final_price, actual_duration,
           status, status_notes, created_at, updated_at, started_at, completed_at,
           rating_for_gardener, rating_for_client
      FROM service_requests
"#;

const USER_COLUMNS: &str = r#"
    SELECT user_id, email, full_name, role, phone, created_at, is_active,
           rating_average, rating_count, gardener_profile
      FROM users
"#;

const NOTIFICATION_COLUMNS: &str = r#"
    SELECT notification_id, user_id, kind, title, message, payload, is_read, created_at
      FROM notifications
"#;

/// Postgres-backed implementation of every repository.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn parse_label<T>(entity: &'static str, raw: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = ParseLabelError>,
{
    raw.parse().map_err(|e: ParseLabelError| StoreError::Corrupt {
        entity,
        reason: e.to_string(),
    })
}

fn non_negative(entity: &'static str, field: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt {
        entity,
        reason: format!("{field} is negative ({value})"),
    })
}

fn as_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn insert_error(err: sqlx::Error, entity: &'static str, key: String) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Duplicate { entity, key };
        }
    }
    StoreError::Database(err)
}

fn service_from_row(row: &PgRow) -> Result<ServiceRequest, StoreError> {
    const ENTITY: &str = "service request";
    let category: String = row.try_get("category")?;
    let status: String = row.try_get("status")?;
    let difficulty: Option<String> = row.try_get("pruning_difficulty")?;
    let estimated_duration: i32 = row.try_get("estimated_duration")?;
    let actual_duration: Option<i32> = row.try_get("actual_duration")?;
    let rating_for_gardener: Option<Json<PartyRating>> = row.try_get("rating_for_gardener")?;
    let rating_for_client: Option<Json<PartyRating>> = row.try_get("rating_for_client")?;

    Ok(ServiceRequest {
        service_id: row.try_get("service_id")?,
        client_id: row.try_get("client_id")?,
        gardener_id: row.try_get("gardener_id")?,
        category: parse_label(ENTITY, &category)?,
        address: row.try_get("address")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        terrain_width: row.try_get("terrain_width")?,
        terrain_length: row.try_get("terrain_length")?,
        pruning_difficulty: difficulty
            .as_deref()
            .map(|d| parse_label(ENTITY, d))
            .transpose()?,
        scheduled_date: row.try_get("scheduled_date")?,
        is_immediate: row.try_get("is_immediate")?,
        notes: row.try_get("notes")?,
        images: row.try_get("images")?,
        estimated_price: row.try_get("estimated_price")?,
        estimated_duration: non_negative(ENTITY, "estimated_duration", estimated_duration)?,
        final_price: row.try_get("final_price")?,
        actual_duration: actual_duration
            .map(|d| non_negative(ENTITY, "actual_duration", d))
            .transpose()?,
        status: parse_label(ENTITY, &status)?,
        status_notes: row.try_get("status_notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        rating_for_gardener: rating_for_gardener.map(|j| j.0),
        rating_for_client: rating_for_client.map(|j| j.0),
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    let role: String = row.try_get("role")?;
    let rating_count: i32 = row.try_get("rating_count")?;
    let gardener: Option<Json<GardenerProfile>> = row.try_get("gardener_profile")?;
    Ok(User {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        full_name: row.try_get("full_name")?,
        role: parse_label("user", &role)?,
        phone: row.try_get("phone")?,
        created_at: row.try_get("created_at")?,
        is_active: row.try_get("is_active")?,
        rating: RatingSummary {
            average: row.try_get("rating_average")?,
            count: non_negative("user", "rating_count", rating_count)?,
        },
        gardener: gardener.map(|j| j.0),
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    let kind: String = row.try_get("kind")?;
    Ok(Notification {
        notification_id: row.try_get("notification_id")?,
        user_id: row.try_get("user_id")?,
        kind: parse_label("notification", &kind)?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        payload: row.try_get("payload")?,
        is_read: row.try_get("is_read")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ServiceRepository for PgStore {
    async fn insert(&self, request: &ServiceRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_requests (
                service_id, client_id, gardener_id, category, address, latitude, longitude,
                terrain_width, terrain_length, pruning_difficulty, scheduled_date, is_immediate,
                notes, images, estimated_price, estimated_duration, final_price, actual_duration,
                status, status_notes, created_at, updated_at, started_at, completed_at,
                rating_for_gardener, rating_for_client
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
            )
            "#,
        )
        .bind(request.service_id)
        .bind(request.client_id)
        .bind(request.gardener_id)
        .bind(request.category.as_str())
        .bind(&request.address)
        .bind(request.latitude)
        .bind(request.longitude)
        .bind(request.terrain_width)
        .bind(request.terrain_length)
        .bind(request.pruning_difficulty.map(|d| d.as_str()))
        .bind(request.scheduled_date)
        .bind(request.is_immediate)
        .bind(&request.notes)
        .bind(&request.images)
        .bind(request.estimated_price)
        .bind(as_i32(request.estimated_duration))
        .bind(request.final_price)
        .bind(request.actual_duration.map(as_i32))
        .bind(request.status.as_str())
        .bind(&request.status_notes)
        .bind(request.created_at)
        .bind(request.updated_at)
        .bind(request.started_at)
        .bind(request.completed_at)
        .bind(request.rating_for_gardener.clone().map(Json))
        .bind(request.rating_for_client.clone().map(Json))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "service request", request.service_id.to_string()))?;
        Ok(())
    }

    async fn get(&self, service_id: Uuid) -> Result<Option<ServiceRequest>, StoreError> {
        let sql = format!("{SERVICE_COLUMNS} WHERE service_id = $1");
        let row = sqlx::query(&sql)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(service_from_row).transpose()
    }

    async fn query(&self, query: &ServiceQuery) -> Result<Vec<ServiceRequest>, StoreError> {
        let sql = format!(
            r#"{SERVICE_COLUMNS}
             WHERE ($1::uuid IS NULL OR client_id = $1)
               AND ($2::uuid IS NULL OR gardener_id = $2)
               AND ($3::text IS NULL OR status = $3)
             ORDER BY created_at DESC
             LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.client_id)
            .bind(query.gardener_id)
            .bind(query.status.map(|s| s.as_str()))
            .bind(query.effective_limit() as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn replace_if(
        &self,
        updated: &ServiceRequest,
        expected_status: ServiceStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE service_requests
               SET gardener_id = $2,
                   status = $3,
                   status_notes = $4,
                   updated_at = $5,
                   started_at = $6,
                   completed_at = $7,
                   final_price = $8,
                   actual_duration = $9,
                   rating_for_gardener = $10,
                   rating_for_client = $11
             WHERE service_id = $1
               AND status = $12
               AND updated_at = $13
            "#,
        )
        .bind(updated.service_id)
        .bind(updated.gardener_id)
        .bind(updated.status.as_str())
        .bind(&updated.status_notes)
        .bind(updated.updated_at)
        .bind(updated.started_at)
        .bind(updated.completed_at)
        .bind(updated.final_price)
        .bind(updated.actual_duration.map(as_i32))
        .bind(updated.rating_for_gardener.clone().map(Json))
        .bind(updated.rating_for_client.clone().map(Json))
        .bind(expected_status.as_str())
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (
                user_id, email, full_name, role, phone, created_at, is_active,
                rating_average, rating_count, gardener_profile
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(user.role.as_str())
        .bind(&user.phone)
        .bind(user.created_at)
        .bind(user.is_active)
        .bind(user.rating.average)
        .bind(as_i32(user.rating.count))
        .bind(user.gardener.clone().map(Json))
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "user", user.email.clone()))?;
        Ok(())
    }

    async fn get(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let sql = format!("{USER_COLUMNS} WHERE user_id = $1");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn available_gardeners(&self, limit: usize) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            r#"{USER_COLUMNS}
             WHERE role = 'gardener'
               AND is_active
               AND COALESCE((gardener_profile->>'is_available')::boolean, FALSE)
             ORDER BY created_at, user_id
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit.min(MAX_QUERY_LIMIT) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn update_with(
        &self,
        user_id: Uuid,
        mutation: UserMutation<'_>,
    ) -> Result<Option<User>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("{USER_COLUMNS} WHERE user_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut user = user_from_row(&row)?;
        mutation(&mut user);

        sqlx::query(
            r#"
            UPDATE users
               SET full_name = $2,
                   phone = $3,
                   is_active = $4,
                   rating_average = $5,
                   rating_count = $6,
                   gardener_profile = $7
             WHERE user_id = $1
            "#,
        )
        .bind(user.user_id)
        .bind(&user.full_name)
        .bind(&user.phone)
        .bind(user.is_active)
        .bind(user.rating.average)
        .bind(as_i32(user.rating.count))
        .bind(user.gardener.clone().map(Json))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(user))
    }
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn insert(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                notification_id, user_id, kind, title, message, payload, is_read, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.notification_id)
        .bind(notification.user_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.payload)
        .bind(notification.is_read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| insert_error(e, "notification", notification.notification_id.to_string()))?;
        Ok(())
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Notification>, StoreError> {
        let sql = format!(
            "{NOTIFICATION_COLUMNS} WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit.clamp(1, MAX_QUERY_LIMIT) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_read(
        &self,
        notification_id: Uuid,
        owner: Uuid,
    ) -> Result<Option<Notification>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE notifications
               SET is_read = TRUE
             WHERE notification_id = $1
               AND user_id = $2
            RETURNING notification_id, user_id, kind, title, message, payload, is_read, created_at
            "#,
        )
        .bind(notification_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(notification_from_row).transpose()
    }
}
