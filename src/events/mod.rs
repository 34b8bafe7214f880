use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), ServiceError> {
        self.sender
            .send(event)
            .await
            .map_err(|e| ServiceError::EventError(format!("Failed to send event: {}", e)))
    }
}

// Define the various events that can occur in the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Pallet events
    PalletCreated {
        pallet_id: Uuid,
        goods_packing_id: Uuid,
        package_quantity: i32,
    },
    PalletDepleted {
        pallet_id: Uuid,
        released_location_id: Option<Uuid>,
    },
    PalletLocationAssigned {
        pallet_id: Uuid,
        location_id: Uuid,
    },
    PalletLocationReleased {
        pallet_id: Uuid,
        location_id: Uuid,
    },
    PickAllocationScanned {
        allocation_id: Uuid,
        pallet_id: Uuid,
    },

    // Disposal events
    DisposalNoteCreated {
        note_id: Uuid,
        warehouse_id: Uuid,
        allocations: usize,
    },
    DisposalNoteStatusChanged {
        note_id: Uuid,
        old_status: String,
        new_status: String,
    },
    DisposalDetailRepicked {
        note_id: Uuid,
        detail_id: Uuid,
        reason: String,
    },
    DisposalNoteApproved {
        note_id: Uuid,
        approved_by: Uuid,
        pallets_depleted: usize,
    },

    // Goods receipt / issue events
    GoodsReceived {
        note_id: Uuid,
        pallets_created: usize,
    },
    GoodsIssueCreated {
        note_id: Uuid,
        allocations: usize,
    },
    GoodsIssued {
        note_id: Uuid,
    },
    GoodsIssueCancelled {
        note_id: Uuid,
    },

    // Ledger events
    LedgerEntriesAppended {
        source_type: String,
        source_id: Uuid,
        entries: usize,
    },

    // Stocktaking events
    StocktakingSheetCreated {
        sheet_id: Uuid,
        warehouse_id: Uuid,
        pallets: usize,
    },
    StocktakingSheetStatusChanged {
        sheet_id: Uuid,
        old_status: String,
        new_status: String,
    },
    StocktakingCompleted {
        sheet_id: Uuid,
        adjusted_pallets: usize,
    },

    // Expiry check
    BatchesExpired {
        batch_ids: Vec<Uuid>,
        affected_pallets: u64,
    },
}

// Function to process incoming events. Events arrive only after the unit of work that raised them committed.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match event {
            Event::PalletDepleted {
                pallet_id,
                released_location_id,
            } => {
                info!(
                    pallet_id = %pallet_id,
                    location_id = ?released_location_id,
                    "Pallet depleted and soft-deleted"
                );
            }
            Event::DisposalNoteApproved {
                note_id,
                approved_by,
                pallets_depleted,
            } => {
                info!(
                    note_id = %note_id,
                    approved_by = %approved_by,
                    pallets_depleted,
                    "Disposal note approved"
                );
            }
            Event::DisposalDetailRepicked {
                note_id,
                detail_id,
                reason,
            } => {
                warn!(
                    note_id = %note_id,
                    detail_id = %detail_id,
                    reason = %reason,
                    "Disposal detail sent back for re-pick"
                );
            }
            Event::StocktakingSheetStatusChanged {
                sheet_id,
                old_status,
                new_status,
            } => {
                info!(
                    sheet_id = %sheet_id,
                    old_status = %old_status,
                    new_status = %new_status,
                    "Stocktaking sheet status changed"
                );
            }
            Event::BatchesExpired {
                batch_ids,
                affected_pallets,
            } => {
                warn!(
                    batches = batch_ids.len(),
                    affected_pallets, "Batches passed their expiry date"
                );
            }
            other => {
                info!("Received event: {:?}", other);
            }
        }
    }

    warn!("Event processing loop has ended");
}
