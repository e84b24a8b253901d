use sea_orm_migration::prelude::*;

use tracelink_relay_migration::Migrator;

#[tokio::main]
async fn main() {
    cli::run_cli(Migrator).await;
}
