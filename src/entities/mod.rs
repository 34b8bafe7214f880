// Reference data
pub mod area;
pub mod goods;
pub mod goods_packing;
pub mod location;
pub mod warehouse;

// Stock
pub mod batch;
pub mod pallet;
pub mod pick_allocation;

// Inbound / outbound documents
pub mod disposal_note;
pub mod disposal_note_detail;
pub mod goods_issue_note;
pub mod goods_issue_note_detail;
pub mod goods_receipt_note;
pub mod goods_receipt_note_detail;

// Journal
pub mod inventory_ledger;

// Stocktaking
pub mod stocktaking_area;
pub mod stocktaking_location;
pub mod stocktaking_pallet;
pub mod stocktaking_sheet;

pub mod notification;
