use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::notification::{self, Entity as NotificationEntity};
use crate::errors::ServiceError;

/// Entity type tags stored on notifications.
pub mod entity_types {
    pub const DISPOSAL_NOTE: &str = "DisposalNote";
    pub const STOCKTAKING_SHEET: &str = "StocktakingSheet";
    pub const GOODS_ISSUE_NOTE: &str = "GoodsIssueNote";
}

/// Delivers workflow messages to warehouse staff.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        entity_id: Uuid,
        entity_type: &str,
        message: &str,
    ) -> Result<(), ServiceError>;

    async fn unread_for_user(&self, user_id: Uuid)
        -> Result<Vec<notification::Model>, ServiceError>;
}

/// Stores notifications in the `notifications` table.
#[derive(Clone)]
pub struct DbNotificationService {
    db_pool: Arc<DatabaseConnection>,
}

impl DbNotificationService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn mark_read(&self, notification_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let existing = NotificationEntity::find_by_id(notification_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Notification {} not found", notification_id))
            })?;

        let mut active: notification::ActiveModel = existing.into();
        active.is_read = Set(true);
        active.update(db).await.map_err(ServiceError::db_error)?;
        Ok(())
    }
}

#[async_trait]
impl NotificationService for DbNotificationService {
    #[instrument(skip(self, message))]
    async fn notify(
        &self,
        user_id: Uuid,
        entity_id: Uuid,
        entity_type: &str,
        message: &str,
    ) -> Result<(), ServiceError> {
        let row = notification::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            entity_id: Set(entity_id),
            entity_type: Set(entity_type.to_string()),
            message: Set(message.to_string()),
            is_read: Set(false),
            created_at: Set(Utc::now()),
        };
        row.insert(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?;

        debug!(user_id = %user_id, entity_id = %entity_id, entity_type, "Notification stored");
        Ok(())
    }

    async fn unread_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<notification::Model>, ServiceError> {
        NotificationEntity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .order_by_desc(notification::Column::CreatedAt)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}

/// Sends a notification and only logs a failure.
///
/// Called after the unit of work committed, so a failed delivery never undoes
/// the business change.
pub async fn notify_or_log(
    notifier: &dyn NotificationService,
    user_id: Uuid,
    entity_id: Uuid,
    entity_type: &str,
    message: &str,
) {
    if let Err(e) = notifier
        .notify(user_id, entity_id, entity_type, message)
        .await
    {
        warn!(
            user_id = %user_id,
            entity_id = %entity_id,
            error = %e,
            "Failed to deliver notification"
        );
    }
}
