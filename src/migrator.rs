use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_reference_tables::Migration),
            Box::new(m20240301_000002_create_stock_tables::Migration),
            Box::new(m20240301_000003_create_document_tables::Migration),
            Box::new(m20240301_000004_create_inventory_ledger::Migration),
            Box::new(m20240301_000005_create_stocktaking_tables::Migration),
            Box::new(m20240301_000006_create_notifications_table::Migration),
        ]
    }
}

// Tables are derived from the entity definitions so the schema cannot drift
// from the models.

mod m20240301_000001_create_reference_tables {
    use crate::entities::{area, goods, goods_packing, location, warehouse};
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_reference_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(warehouse::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(area::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(location::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(goods::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(goods_packing::Entity))
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_locations_area")
                        .table(location::Entity)
                        .col(location::Column::AreaId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(goods_packing::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(location::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(area::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(warehouse::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000002_create_stock_tables {
    use crate::entities::{batch, pallet, pick_allocation};
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(batch::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(pallet::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(pick_allocation::Entity))
                .await?;

            // FEFO candidate lookup
            manager
                .create_index(
                    Index::create()
                        .name("idx_pallets_warehouse_packing")
                        .table(pallet::Entity)
                        .col(pallet::Column::WarehouseId)
                        .col(pallet::Column::GoodsPackingId)
                        .to_owned(),
                )
                .await?;
            manager
                .create_index(
                    Index::create()
                        .name("idx_pick_allocations_pallet")
                        .table(pick_allocation::Entity)
                        .col(pick_allocation::Column::PalletId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(pick_allocation::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(pallet::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(batch::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000003_create_document_tables {
    use crate::entities::{
        disposal_note, disposal_note_detail, goods_issue_note, goods_issue_note_detail,
        goods_receipt_note, goods_receipt_note_detail,
    };
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_document_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(goods_receipt_note::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(goods_receipt_note_detail::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(goods_issue_note::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(goods_issue_note_detail::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(disposal_note::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(disposal_note_detail::Entity))
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_disposal_note_details_note")
                        .table(disposal_note_detail::Entity)
                        .col(disposal_note_detail::Column::NoteId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(disposal_note_detail::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(disposal_note::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_issue_note_detail::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_issue_note::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_receipt_note_detail::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(goods_receipt_note::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000004_create_inventory_ledger {
    use crate::entities::inventory_ledger;
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_inventory_ledger"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(inventory_ledger::Entity))
                .await?;

            // A concurrent append for the same pair collides here instead of forking the chain.
            manager
                .create_index(
                    Index::create()
                        .name("ux_inventory_ledger_pair_sequence")
                        .table(inventory_ledger::Entity)
                        .col(inventory_ledger::Column::GoodsId)
                        .col(inventory_ledger::Column::GoodsPackingId)
                        .col(inventory_ledger::Column::Sequence)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // One row per pair per source event.
            manager
                .create_index(
                    Index::create()
                        .name("ux_inventory_ledger_source_pair")
                        .table(inventory_ledger::Entity)
                        .col(inventory_ledger::Column::SourceType)
                        .col(inventory_ledger::Column::SourceId)
                        .col(inventory_ledger::Column::GoodsId)
                        .col(inventory_ledger::Column::GoodsPackingId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(inventory_ledger::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000005_create_stocktaking_tables {
    use crate::entities::{
        stocktaking_area, stocktaking_location, stocktaking_pallet, stocktaking_sheet,
    };
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_stocktaking_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(stocktaking_sheet::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(stocktaking_area::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(stocktaking_location::Entity))
                .await?;
            manager
                .create_table(schema.create_table_from_entity(stocktaking_pallet::Entity))
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_stocktaking_sheets_warehouse_status")
                        .table(stocktaking_sheet::Entity)
                        .col(stocktaking_sheet::Column::WarehouseId)
                        .col(stocktaking_sheet::Column::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(stocktaking_pallet::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(stocktaking_location::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(stocktaking_area::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(stocktaking_sheet::Entity).to_owned())
                .await
        }
    }
}

mod m20240301_000006_create_notifications_table {
    use crate::entities::notification;
    use sea_orm::Schema;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_notifications_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            let schema = Schema::new(manager.get_database_backend());

            manager
                .create_table(schema.create_table_from_entity(notification::Entity))
                .await?;
            manager
                .create_index(
                    Index::create()
                        .name("idx_notifications_user")
                        .table(notification::Entity)
                        .col(notification::Column::UserId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(notification::Entity).to_owned())
                .await
        }
    }
}
