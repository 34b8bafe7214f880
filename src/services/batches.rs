use chrono::{Duration, NaiveDate, Utc};
use metrics::counter;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::config::AppConfig;
use crate::entities::{
    batch::{self, BatchStatus, Entity as BatchEntity},
    goods,
};
use crate::errors::ServiceError;

/// Bounds applied to the dates of a new batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDateLimits {
    pub max_manufacturing_age_days: i64,
    pub max_shelf_life_days: i64,
}

impl Default for BatchDateLimits {
    fn default() -> Self {
        Self {
            max_manufacturing_age_days: 365,
            max_shelf_life_days: 730,
        }
    }
}

impl From<&AppConfig> for BatchDateLimits {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_manufacturing_age_days: cfg.max_manufacturing_age_days,
            max_shelf_life_days: cfg.max_shelf_life_days,
        }
    }
}

/// Checks that a batch's dates are plausible on `today`.
pub fn validate_batch_dates(
    manufacturing_date: NaiveDate,
    expiry_date: NaiveDate,
    today: NaiveDate,
    limits: &BatchDateLimits,
) -> Result<(), ServiceError> {
    if expiry_date <= manufacturing_date {
        return Err(ServiceError::ValidationError(
            "Expiry date must be after the manufacturing date".to_string(),
        ));
    }
    if manufacturing_date > today {
        return Err(ServiceError::ValidationError(
            "Manufacturing date cannot be in the future".to_string(),
        ));
    }
    if manufacturing_date < today - Duration::days(limits.max_manufacturing_age_days) {
        return Err(ServiceError::ValidationError(format!(
            "Manufacturing date is more than {} days in the past",
            limits.max_manufacturing_age_days
        )));
    }
    if expiry_date < today {
        return Err(ServiceError::ValidationError(
            "Batch is already expired".to_string(),
        ));
    }
    if (expiry_date - manufacturing_date).num_days() > limits.max_shelf_life_days {
        return Err(ServiceError::ValidationError(format!(
            "Shelf life exceeds {} days",
            limits.max_shelf_life_days
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateBatchInput {
    pub goods_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub manufacturing_date: NaiveDate,
    pub expiry_date: NaiveDate,
}

#[derive(Clone)]
pub struct BatchService {
    db_pool: Arc<DatabaseConnection>,
    limits: BatchDateLimits,
}

impl BatchService {
    pub fn new(db_pool: Arc<DatabaseConnection>, limits: BatchDateLimits) -> Self {
        Self { db_pool, limits }
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create_batch(
        &self,
        input: CreateBatchInput,
        today: NaiveDate,
    ) -> Result<batch::Model, ServiceError> {
        input.validate()?;
        validate_batch_dates(
            input.manufacturing_date,
            input.expiry_date,
            today,
            &self.limits,
        )?;

        let db = &*self.db_pool;
        goods::Entity::find_by_id(input.goods_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Goods {} not found", input.goods_id)))?;

        let duplicate = BatchEntity::find()
            .filter(batch::Column::GoodsId.eq(input.goods_id))
            .filter(batch::Column::Code.eq(input.code.clone()))
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;
        if duplicate.is_some() {
            return Err(ServiceError::Conflict(format!(
                "Batch {} already exists for this goods",
                input.code
            )));
        }

        let created = batch::ActiveModel {
            id: Set(Uuid::new_v4()),
            goods_id: Set(input.goods_id),
            code: Set(input.code),
            manufacturing_date: Set(input.manufacturing_date),
            expiry_date: Set(input.expiry_date),
            status: Set(BatchStatus::Active),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        counter!("batches.created", 1);
        info!(batch_id = %created.id, expiry_date = %created.expiry_date, "Batch created");
        Ok(created)
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> Result<batch::Model, ServiceError> {
        BatchEntity::find_by_id(batch_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("Batch {} not found", batch_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn plausible_dates_pass() {
        let today = d(2024, 6, 1);
        assert!(
            validate_batch_dates(d(2024, 5, 20), d(2024, 7, 1), today, &BatchDateLimits::default())
                .is_ok()
        );
    }

    #[test]
    fn expiry_must_follow_manufacturing() {
        let today = d(2024, 6, 1);
        let err = validate_batch_dates(
            d(2024, 5, 20),
            d(2024, 5, 20),
            today,
            &BatchDateLimits::default(),
        )
        .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[test]
    fn future_manufacturing_is_rejected() {
        let today = d(2024, 6, 1);
        assert!(validate_batch_dates(
            d(2024, 6, 2),
            d(2024, 8, 1),
            today,
            &BatchDateLimits::default()
        )
        .is_err());
    }

    #[test]
    fn limits_are_respected() {
        let today = d(2024, 6, 1);
        let limits = BatchDateLimits {
            max_manufacturing_age_days: 30,
            max_shelf_life_days: 60,
        };
        assert!(validate_batch_dates(d(2024, 4, 1), d(2024, 7, 1), today, &limits).is_err());
        assert!(validate_batch_dates(d(2024, 5, 15), d(2024, 8, 1), today, &limits).is_err());
        assert!(validate_batch_dates(d(2024, 5, 15), d(2024, 7, 1), today, &limits).is_ok());
    }
}
