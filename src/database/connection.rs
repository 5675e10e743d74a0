use mongodb::{bson::doc, options::IndexOptions, Client, Database, IndexModel};

use crate::config::AppConfig;
use crate::database::booking_repository::BOOKINGS_COLLECTION;
use crate::database::leases::LEASES_COLLECTION;
use crate::errors::Result;
use crate::models::booking::Booking;

pub async fn get_db_client(config: &AppConfig) -> Result<Database> {
    let client = Client::with_uri_str(&config.database_url).await?;
    let db = client.database(&config.database_name);

    db.run_command(doc! { "ping": 1 }).await?;
    tracing::info!(database = %config.database_name, "✅ Connected to MongoDB");

    Ok(db)
}

/// Indexes backing the availability, cleanup and reconciliation queries.
pub async fn ensure_indexes(db: &Database) -> Result<()> {
    let bookings = db.collection::<Booking>(BOOKINGS_COLLECTION);
    bookings
        .create_indexes(vec![
            IndexModel::builder()
                .keys(doc! { "retreat_id": 1, "session_start": 1, "state": 1 })
                .build(),
            IndexModel::builder()
                .keys(doc! { "payment_intent_id": 1 })
                .options(IndexOptions::builder().sparse(true).build())
                .build(),
            IndexModel::builder().keys(doc! { "user_id": 1 }).build(),
            IndexModel::builder()
                .keys(doc! { "state": 1, "created_at": 1 })
                .build(),
        ])
        .await?;

    // Leases disappear on their own once expired.
    db.collection::<mongodb::bson::Document>(LEASES_COLLECTION)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "expires_at": 1 })
                .options(
                    IndexOptions::builder()
                        .expire_after(std::time::Duration::from_secs(0))
                        .build(),
                )
                .build(),
        )
        .await?;

    tracing::info!("📂 Booking indexes ensured");
    Ok(())
}
