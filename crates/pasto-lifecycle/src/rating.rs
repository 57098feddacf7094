use std::sync::Arc;

use pasto_core::{round_to, RatingSummary, User};
use pasto_storage::UserRepository;
use tracing::warn;
use uuid::Uuid;

use crate::LifecycleError;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// One-pass mean update; the stored average keeps one decimal.
pub fn incremental_mean(summary: RatingSummary, rating: u8) -> RatingSummary {
    let count = summary.count.saturating_add(1);
    let total = summary.average * f64::from(summary.count) + f64::from(rating);
    RatingSummary {
        average: round_to(total / f64::from(count), 1),
        count,
    }
}

pub fn validate_rating(rating: u8) -> Result<(), LifecycleError> {
    if (MIN_RATING..=MAX_RATING).contains(&rating) {
        Ok(())
    } else {
        Err(LifecycleError::Validation(format!(
            "rating must be between {MIN_RATING} and {MAX_RATING}, got {rating}"
        )))
    }
}

/// Running average rating per user.
#[derive(Clone)]
pub struct RatingAggregator {
    users: Arc<dyn UserRepository>,
}

impl RatingAggregator {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    /// Fold `rating` into the user's average under the store's row lock.
    ///
    /// A missing user is a silent no-op (`Ok(None)`), logged at warn level.
    pub async fn apply_rating(
        &self,
        user_id: Uuid,
        rating: u8,
    ) -> Result<Option<RatingSummary>, LifecycleError> {
        validate_rating(rating)?;
        let updated = self
            .users
            .update_with(user_id, &|user: &mut User| {
                user.rating = incremental_mean(user.rating, rating);
            })
            .await?;
        match updated {
            Some(user) => Ok(Some(user.rating)),
            None => {
                warn!(%user_id, rating, "rating dropped: user does not exist");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pasto_core::UserRole;
    use pasto_storage::Stores;

    #[test]
    fn mean_of_four_and_two_is_three_in_either_order() {
        let a = incremental_mean(incremental_mean(RatingSummary::default(), 4), 2);
        let b = incremental_mean(incremental_mean(RatingSummary::default(), 2), 4);
        assert_eq!(a, RatingSummary { average: 3.0, count: 2 });
        assert_eq!(a, b);
    }

    #[test]
    fn average_is_kept_to_one_decimal() {
        let s = incremental_mean(RatingSummary { average: 4.0, count: 2 }, 5);
        assert_eq!(s.average, 4.3);
        assert_eq!(s.count, 3);
    }

    #[test]
    fn out_of_range_ratings_are_validation_errors() {
        assert!(matches!(validate_rating(0), Err(LifecycleError::Validation(_))));
        assert!(matches!(validate_rating(6), Err(LifecycleError::Validation(_))));
        assert!(validate_rating(5).is_ok());
    }

    #[tokio::test]
    async fn missing_user_is_a_no_op() {
        let stores = Stores::in_memory();
        let aggregator = RatingAggregator::new(stores.users.clone());
        assert_eq!(aggregator.apply_rating(Uuid::new_v4(), 4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_ratings_are_not_lost() {
        let stores = Stores::in_memory();
        let user = User::new("g@pasto.test", "G", UserRole::Gardener, None, Utc::now());
        stores.users.insert(&user).await.unwrap();
        let aggregator = RatingAggregator::new(stores.users.clone());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let aggregator = aggregator.clone();
            let id = user.user_id;
            handles.push(tokio::spawn(async move { aggregator.apply_rating(id, 5).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let stored = stores.users.get(user.user_id).await.unwrap().unwrap();
        assert_eq!(stored.rating, RatingSummary { average: 5.0, count: 10 });
    }
}
