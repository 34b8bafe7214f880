use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        batches::{BatchDateLimits, BatchService},
        disposal_notes::DisposalNoteService,
        expiry_check::ExpiryCheckService,
        goods_issues::GoodsIssueService,
        goods_receipts::GoodsReceiptService,
        inventory_ledger::InventoryLedgerService,
        notifications::{DbNotificationService, NotificationService},
        pallets::PalletService,
        pick_allocation::PickAllocationService,
        stocktaking::StocktakingService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    event_sender: EventSender,
    notifier: Arc<dyn NotificationService>,
    batch_limits: BatchDateLimits,
}

impl ServiceFactory {
    /// Creates a factory whose staff notifications are stored in the database
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender, config: &AppConfig) -> Self {
        let notifier: Arc<dyn NotificationService> =
            Arc::new(DbNotificationService::new(db_pool.clone()));
        Self::with_notifier(db_pool, event_sender, notifier, BatchDateLimits::from(config))
    }

    pub fn with_notifier(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        notifier: Arc<dyn NotificationService>,
        batch_limits: BatchDateLimits,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            notifier,
            batch_limits,
        }
    }

    pub fn batch_service(&self) -> BatchService {
        BatchService::new(self.db_pool.clone(), self.batch_limits)
    }

    pub fn pallet_service(&self) -> PalletService {
        PalletService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn pick_allocation_service(&self) -> PickAllocationService {
        PickAllocationService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn ledger_service(&self) -> InventoryLedgerService {
        InventoryLedgerService::new(self.db_pool.clone())
    }

    pub fn disposal_note_service(&self) -> DisposalNoteService {
        DisposalNoteService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.notifier.clone(),
        )
    }

    pub fn goods_receipt_service(&self) -> GoodsReceiptService {
        GoodsReceiptService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn goods_issue_service(&self) -> GoodsIssueService {
        GoodsIssueService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.notifier.clone(),
        )
    }

    pub fn stocktaking_service(&self) -> StocktakingService {
        StocktakingService::new(
            self.db_pool.clone(),
            self.event_sender.clone(),
            self.notifier.clone(),
        )
    }

    pub fn expiry_check_service(&self) -> ExpiryCheckService {
        ExpiryCheckService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    pub fn notifier(&self) -> &Arc<dyn NotificationService> {
        &self.notifier
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub batches: Arc<BatchService>,
    pub pallets: Arc<PalletService>,
    pub picking: Arc<PickAllocationService>,
    pub ledger: Arc<InventoryLedgerService>,
    pub disposal_notes: Arc<DisposalNoteService>,
    pub goods_receipts: Arc<GoodsReceiptService>,
    pub goods_issues: Arc<GoodsIssueService>,
    pub stocktaking: Arc<StocktakingService>,
    pub expiry_check: Arc<ExpiryCheckService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            batches: Arc::new(factory.batch_service()),
            pallets: Arc::new(factory.pallet_service()),
            picking: Arc::new(factory.pick_allocation_service()),
            ledger: Arc::new(factory.ledger_service()),
            disposal_notes: Arc::new(factory.disposal_note_service()),
            goods_receipts: Arc::new(factory.goods_receipt_service()),
            goods_issues: Arc::new(factory.goods_issue_service()),
            stocktaking: Arc::new(factory.stocktaking_service()),
            expiry_check: Arc::new(factory.expiry_check_service()),
        }
    }
}
