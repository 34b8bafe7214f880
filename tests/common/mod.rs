#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use dairy_wms::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{
        area,
        batch::{self, BatchStatus},
        goods, goods_packing, location,
        pallet::{self, PalletStatus},
        warehouse,
    },
    events::{self, EventSender},
    services::{
        factory::{ServiceContainer, ServiceFactory},
        pallets::CreatePalletInput,
    },
};

/// Reference date used by every workflow test.
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 1).expect("valid date")
}

/// In-memory warehouse backed by a single SQLite connection.
pub struct TestWarehouse {
    pub db: Arc<DatabaseConnection>,
    pub factory: ServiceFactory,
    pub services: ServiceContainer,
    pub warehouse_id: Uuid,
    pub area_id: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestWarehouse {
    pub async fn new() -> Self {
        let pool = db::establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (tx, rx) = mpsc::channel(256);
        let event_task = tokio::spawn(events::process_events(rx));
        let cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        let factory = ServiceFactory::new(db.clone(), EventSender::new(tx), &cfg);
        let services = ServiceContainer::new(&factory);

        let warehouse_id = Uuid::new_v4();
        warehouse::ActiveModel {
            id: Set(warehouse_id),
            code: Set("WH-MAIN".to_string()),
            name: Set("Main cold store".to_string()),
        }
        .insert(&*db)
        .await
        .expect("seed warehouse");

        let area_id = Uuid::new_v4();
        area::ActiveModel {
            id: Set(area_id),
            warehouse_id: Set(warehouse_id),
            name: Set("Chiller A".to_string()),
        }
        .insert(&*db)
        .await
        .expect("seed area");

        Self {
            db,
            factory,
            services,
            warehouse_id,
            area_id,
            _event_task: event_task,
        }
    }

    pub async fn add_area(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        area::ActiveModel {
            id: Set(id),
            warehouse_id: Set(self.warehouse_id),
            name: Set(name.to_string()),
        }
        .insert(&*self.db)
        .await
        .expect("seed area");
        id
    }

    pub async fn add_location(&self, area_id: Uuid, code: &str) -> Uuid {
        let id = Uuid::new_v4();
        location::ActiveModel {
            id: Set(id),
            area_id: Set(area_id),
            code: Set(code.to_string()),
            is_available: Set(true),
        }
        .insert(&*self.db)
        .await
        .expect("seed location");
        id
    }

    /// Seeds a goods item with one packing and returns `(goods_id, packing_id)`.
    pub async fn add_goods(&self, code: &str, name: &str) -> (Uuid, Uuid) {
        let goods_id = Uuid::new_v4();
        goods::ActiveModel {
            id: Set(goods_id),
            code: Set(code.to_string()),
            name: Set(name.to_string()),
        }
        .insert(&*self.db)
        .await
        .expect("seed goods");

        let packing_id = Uuid::new_v4();
        goods_packing::ActiveModel {
            id: Set(packing_id),
            goods_id: Set(goods_id),
            name: Set("Crate of 12".to_string()),
            units_per_package: Set(12),
        }
        .insert(&*self.db)
        .await
        .expect("seed packing");
        (goods_id, packing_id)
    }

    /// Inserts a batch directly so tests can seed stock that is already expired.
    pub async fn add_batch(&self, goods_id: Uuid, code: &str, expiry_date: NaiveDate) -> Uuid {
        let id = Uuid::new_v4();
        let status = if expiry_date < today() {
            BatchStatus::Expired
        } else {
            BatchStatus::Active
        };
        batch::ActiveModel {
            id: Set(id),
            goods_id: Set(goods_id),
            code: Set(code.to_string()),
            manufacturing_date: Set(expiry_date - Duration::days(30)),
            expiry_date: Set(expiry_date),
            status: Set(status),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("seed batch");
        id
    }

    pub async fn add_pallet(
        &self,
        code: &str,
        batch_id: Uuid,
        packing_id: Uuid,
        quantity: i32,
        location_id: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        pallet::ActiveModel {
            id: Set(id),
            code: Set(code.to_string()),
            warehouse_id: Set(self.warehouse_id),
            batch_id: Set(batch_id),
            goods_packing_id: Set(packing_id),
            location_id: Set(location_id),
            goods_receipt_note_id: Set(None),
            package_quantity: Set(quantity),
            status: Set(PalletStatus::Active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed pallet");
        if let Some(location_id) = location_id {
            let mut loc: location::ActiveModel = location::Entity::find_by_id(location_id)
                .one(&*self.db)
                .await
                .expect("load location")
                .expect("location exists")
                .into();
            loc.is_available = Set(false);
            loc.update(&*self.db).await.expect("occupy location");
        }
        id
    }

    /// Creates a pallet through the service so it is booked in the ledger.
    pub async fn stock_pallet(
        &self,
        code: &str,
        batch_id: Uuid,
        packing_id: Uuid,
        quantity: i32,
        location_id: Option<Uuid>,
    ) -> pallet::Model {
        self.services
            .pallets
            .create_pallet(CreatePalletInput {
                code: code.to_string(),
                warehouse_id: self.warehouse_id,
                batch_id,
                goods_packing_id: packing_id,
                package_quantity: quantity,
                location_id,
            })
            .await
            .expect("create pallet")
    }

    pub async fn pallet(&self, pallet_id: Uuid) -> pallet::Model {
        self.services
            .pallets
            .get_pallet(pallet_id)
            .await
            .expect("pallet exists")
    }

    /// Empties a pallet behind the services' back, freeing its location.
    pub async fn wipe_pallet(&self, pallet_id: Uuid) {
        let current = self.pallet(pallet_id).await;
        if let Some(location_id) = current.location_id {
            let mut slot: location::ActiveModel = self.location(location_id).await.into();
            slot.is_available = Set(true);
            slot.update(&*self.db).await.expect("free location");
        }
        let mut active: pallet::ActiveModel = current.into();
        active.package_quantity = Set(0);
        active.status = Set(PalletStatus::Deleted);
        active.location_id = Set(None);
        active.update(&*self.db).await.expect("wipe pallet");
    }

    pub async fn location(&self, location_id: Uuid) -> location::Model {
        location::Entity::find_by_id(location_id)
            .one(&*self.db)
            .await
            .expect("load location")
            .expect("location exists")
    }
}
