/*!
 * Unit of work
 *
 * Wraps a database transaction so that every write of a business operation
 * commits or rolls back together. Dropping a `UnitOfWork` without calling
 * `commit` rolls the transaction back.
 */

use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// Explicit transaction scope handed by reference into every repository write.
///
/// Events recorded on the unit are published only after a successful commit.
pub struct UnitOfWork {
    txn: DatabaseTransaction,
    pending_events: Vec<Event>,
}

impl UnitOfWork {
    pub async fn begin(db: &DatabaseConnection) -> Result<Self, ServiceError> {
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        Ok(Self {
            txn,
            pending_events: Vec::new(),
        })
    }

    /// Connection to run statements inside this unit.
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// Buffers an event until the unit commits.
    pub fn record(&mut self, event: Event) {
        self.pending_events.push(event);
    }

    pub fn pending_events(&self) -> &[Event] {
        &self.pending_events
    }

    /// Commits the transaction, then publishes the buffered events.
    ///
    /// Publishing is best-effort: the data is already committed, so a closed
    /// event channel is only logged.
    pub async fn commit(self, events: &EventSender) -> Result<(), ServiceError> {
        let Self {
            txn,
            pending_events,
        } = self;

        txn.commit().await.map_err(ServiceError::db_error)?;
        debug!(events = pending_events.len(), "Unit of work committed");

        for event in pending_events {
            if let Err(e) = events.send(event).await {
                warn!(error = %e, "Failed to publish event after commit");
            }
        }
        Ok(())
    }

    /// Rolls back explicitly. Dropping the unit has the same effect.
    pub async fn rollback(self) -> Result<(), ServiceError> {
        self.txn.rollback().await.map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use crate::entities::warehouse;
    use sea_orm::{ActiveModelTrait, EntityTrait, Set};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn setup() -> DatabaseConnection {
        let db = establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("connect");
        run_migrations(&db).await.expect("migrate");
        db
    }

    fn warehouse_model(id: Uuid) -> warehouse::ActiveModel {
        warehouse::ActiveModel {
            id: Set(id),
            code: Set(format!("WH-{}", &id.to_string()[..8])),
            name: Set("Main".to_string()),
        }
    }

    #[tokio::test]
    async fn dropped_unit_rolls_back() {
        let db = setup().await;
        let id = Uuid::new_v4();
        {
            let uow = UnitOfWork::begin(&db).await.unwrap();
            warehouse_model(id).insert(uow.conn()).await.unwrap();
        }
        let found = warehouse::Entity::find_by_id(id).one(&db).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn commit_persists_and_publishes_events() {
        let db = setup().await;
        let (tx, mut rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        let id = Uuid::new_v4();

        let mut uow = UnitOfWork::begin(&db).await.unwrap();
        warehouse_model(id).insert(uow.conn()).await.unwrap();
        uow.record(Event::BatchesExpired {
            batch_ids: vec![id],
            affected_pallets: 0,
        });
        assert_eq!(uow.pending_events().len(), 1);
        uow.commit(&sender).await.unwrap();

        let found = warehouse::Entity::find_by_id(id).one(&db).await.unwrap();
        assert!(found.is_some());
        assert!(rx.recv().await.is_some());
    }
}
