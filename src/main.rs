use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use retreat_booking::config::{AppConfig, LogFormat};
use retreat_booking::database::booking_repository::{BookingRepository, MongoBookingRepository};
use retreat_booking::database::connection::{ensure_indexes, get_db_client};
use retreat_booking::database::leases::{LeaseLock, MongoLeaseLock, RedisLeaseLock};
use retreat_booking::database::retreat_catalog::{MongoRetreatCatalog, RetreatCatalog};
use retreat_booking::routes::build_router;
use retreat_booking::services::booking_service::BookingService;
use retreat_booking::services::email_service::{DisabledNotifier, EmailService, Notifier};
use retreat_booking::services::reconciliation_service::ReconciliationService;
use retreat_booking::services::scheduler::spawn_background_jobs;
use retreat_booking::services::stripe_service::{PaymentGateway, StripeService};
use retreat_booking::state::AppState;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("retreat_booking=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    init_tracing(config.log_format);
    tracing::info!(config = %config.get_config_info(), "⚙️ Configuration loaded");

    let db = get_db_client(&config).await.context("connecting to MongoDB")?;
    ensure_indexes(&db).await.context("creating indexes")?;

    let locks: Arc<dyn LeaseLock> = match &config.redis_url {
        Some(url) => {
            tracing::info!("🔒 Using Redis for seat leases");
            Arc::new(RedisLeaseLock::new(url)?)
        }
        None => {
            tracing::info!("🔒 Using MongoDB for seat leases");
            Arc::new(MongoLeaseLock::new(&db))
        }
    };

    let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeService::new(
        config.stripe_api_base.clone(),
        config.stripe_secret_key.clone(),
        config.stripe_webhook_secret.clone(),
        config.gateway_timeout,
    )?);

    let notifier: Arc<dyn Notifier> = match config.email.clone() {
        Some(email) => {
            tracing::info!("📧 Email notifications enabled");
            Arc::new(EmailService::new(email, config.gateway_timeout)?)
        }
        None => {
            tracing::warn!("Email provider not configured, notifications will only be logged");
            Arc::new(DisabledNotifier)
        }
    };

    let bookings: Arc<dyn BookingRepository> = Arc::new(MongoBookingRepository::new(&db));
    let retreats: Arc<dyn RetreatCatalog> = Arc::new(MongoRetreatCatalog::new(&db));

    let booking_service = Arc::new(BookingService::new(
        bookings.clone(),
        retreats,
        gateway.clone(),
        notifier.clone(),
        locks.clone(),
        config.policy.clone(),
    ));
    let reconciliation = Arc::new(ReconciliationService::new(
        bookings,
        gateway,
        notifier,
        config.policy.clone(),
        config.schedule.discrepancy_lookback,
    ));

    let _jobs = spawn_background_jobs(reconciliation.clone(), locks, config.schedule.clone());

    let app_state = AppState::new(booking_service, reconciliation, config.jwt_secret.clone())
        .with_db(db)
        .with_grace_minutes(config.schedule.discrepancy_grace_minutes);
    let app = build_router(app_state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("🚀 Server starting on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
