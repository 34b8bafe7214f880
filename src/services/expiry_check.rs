use chrono::{NaiveDate, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::entities::{
    batch::{self, BatchStatus},
    pallet::{self, PalletStatus},
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryCheckReport {
    pub expired_batches: Vec<Uuid>,
    /// Active pallets with stock left on the batches that just expired.
    pub affected_pallets: u64,
}

/// Flags batches whose expiry date has passed so they show up for disposal.
#[derive(Clone)]
pub struct ExpiryCheckService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl ExpiryCheckService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self, today: NaiveDate) -> Result<ExpiryCheckReport, ServiceError> {
        let mut uow = UnitOfWork::begin(&self.db_pool).await?;

        let expired_batches: Vec<Uuid> = batch::Entity::find()
            .filter(batch::Column::Status.eq(BatchStatus::Active))
            .filter(batch::Column::ExpiryDate.lt(today))
            .all(uow.conn())
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|b| b.id)
            .collect();

        if expired_batches.is_empty() {
            uow.commit(&self.event_sender).await?;
            return Ok(ExpiryCheckReport::default());
        }

        batch::Entity::update_many()
            .col_expr(batch::Column::Status, Expr::value(BatchStatus::Expired))
            .filter(batch::Column::Id.is_in(expired_batches.clone()))
            .exec(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        let affected_pallets = pallet::Entity::find()
            .filter(pallet::Column::BatchId.is_in(expired_batches.clone()))
            .filter(pallet::Column::Status.eq(PalletStatus::Active))
            .filter(pallet::Column::PackageQuantity.gt(0))
            .count(uow.conn())
            .await
            .map_err(ServiceError::db_error)?;

        uow.record(Event::BatchesExpired {
            batch_ids: expired_batches.clone(),
            affected_pallets,
        });
        uow.commit(&self.event_sender).await?;

        counter!("batches.expired", expired_batches.len() as u64);
        info!(
            batches = expired_batches.len(),
            affected_pallets, "Batches marked as expired"
        );
        Ok(ExpiryCheckReport {
            expired_batches,
            affected_pallets,
        })
    }

    /// Runs the check on a fixed interval until the task is aborted.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "Starting batch expiry checker");
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let today = Utc::now().date_naive();
                if let Err(e) = self.run_once(today).await {
                    error!(error = %e, "Batch expiry check failed");
                }
            }
        })
    }
}
