use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OutboxEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OutboxEvents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OutboxEvents::EventType).string().not_null())
                    .col(
                        ColumnDef::new(OutboxEvents::AggregateType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OutboxEvents::AggregateId)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OutboxEvents::ProjectId).uuid().not_null())
                    .col(
                        ColumnDef::new(OutboxEvents::Payload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OutboxEvents::Status)
                            .string_len(16)
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(
                        ColumnDef::new(OutboxEvents::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(OutboxEvents::LastError).text())
                    // NULLs do not collide, so only keyed appends are deduplicated.
                    .col(
                        ColumnDef::new(OutboxEvents::IdempotencyKey)
                            .string()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(OutboxEvents::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OutboxEvents::PublishedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        // Poll queries: oldest PENDING first.
        manager
            .create_index(
                Index::create()
                    .table(OutboxEvents::Table)
                    .col(OutboxEvents::Status)
                    .col(OutboxEvents::CreatedAt)
                    .name("idx_outbox_events_status_created_at")
                    .to_owned(),
            )
            .await?;

        // Per-aggregate ordering checks.
        manager
            .create_index(
                Index::create()
                    .table(OutboxEvents::Table)
                    .col(OutboxEvents::AggregateId)
                    .name("idx_outbox_events_aggregate_id")
                    .to_owned(),
            )
            .await?;

        // Per-project health queries and retention.
        manager
            .create_index(
                Index::create()
                    .table(OutboxEvents::Table)
                    .col(OutboxEvents::ProjectId)
                    .col(OutboxEvents::Status)
                    .name("idx_outbox_events_project_id_status")
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OutboxEvents::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum OutboxEvents {
    Table,
    Id,
    EventType,
    AggregateType,
    AggregateId,
    ProjectId,
    Payload,
    Status,
    RetryCount,
    LastError,
    IdempotencyKey,
    CreatedAt,
    PublishedAt,
}
