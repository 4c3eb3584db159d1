use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use slotbot::config::{AppConfig, SessionBackend};
use slotbot::db;
use slotbot::handlers;
use slotbot::models::ServiceCatalog;
use slotbot::services::calendar::BusinessCalendar;
use slotbot::services::conversation::{BookingOrchestrator, BookingSettings};
use slotbot::services::messaging::whatsapp::WhatsAppCloudProvider;
use slotbot::services::messaging::MessagingProvider;
use slotbot::services::receipt::IcsReceiptGenerator;
use slotbot::services::sessions::{
    spawn_sweeper, InMemorySessionStore, SessionStore, SqliteSessionStore,
};
use slotbot::services::slots::{SlotStore, SqliteSlotStore};
use slotbot::services::transcription::{GroqTranscriber, Transcriber};
use slotbot::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env()?;

    let conn = db::init_db(&config.database_url)?;
    let db: db::Db = Arc::new(Mutex::new(conn));

    let catalog = ServiceCatalog::load(config.service_catalog_path.as_deref())?;
    tracing::info!(services = catalog.services.len(), "service catalog loaded");

    if config.whatsapp_access_token.is_empty() || config.whatsapp_phone_number_id.is_empty() {
        tracing::warn!("WhatsApp credentials not configured, outbound messages will fail");
    }
    if config.whatsapp_app_secret.is_empty() {
        tracing::warn!("WHATSAPP_APP_SECRET not set, webhook signatures are not checked");
    }

    let messaging: Arc<dyn MessagingProvider> = Arc::new(WhatsAppCloudProvider::new(
        config.whatsapp_access_token.clone(),
        config.whatsapp_phone_number_id.clone(),
        config.whatsapp_api_base.clone(),
        config.whatsapp_api_version.clone(),
    ));

    let transcriber: Option<Box<dyn Transcriber>> = if config.groq_api_key.is_empty() {
        tracing::info!("no GROQ_API_KEY, voice notes will not be transcribed");
        None
    } else {
        tracing::info!(model = %config.groq_transcription_model, "using Groq transcription");
        Some(Box::new(GroqTranscriber::new(
            config.groq_api_key.clone(),
            config.groq_transcription_model.clone(),
        )))
    };

    let slots: Arc<dyn SlotStore> = Arc::new(SqliteSlotStore::new(
        db.clone(),
        BusinessCalendar::from_config(&config),
    ));

    let sessions: Arc<dyn SessionStore> = match config.session_backend {
        SessionBackend::Memory => Arc::new(InMemorySessionStore::new()),
        SessionBackend::Sqlite => Arc::new(SqliteSessionStore::new(db.clone())),
    };
    tracing::info!(backend = ?config.session_backend, "session store ready");

    let receipts = Arc::new(IcsReceiptGenerator::new(
        config.business_name.clone(),
        config.timezone,
        config.appointment_minutes,
        config.public_base_url.clone(),
    ));

    spawn_sweeper(
        sessions.clone(),
        slots.clone(),
        chrono::Duration::hours(config.session_ttl_hours),
        std::time::Duration::from_secs(config.session_sweep_minutes.max(1) * 60),
    );

    let orchestrator = BookingOrchestrator::new(
        slots,
        sessions,
        messaging.clone(),
        receipts,
        catalog,
        BookingSettings::from_config(&config),
    );

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        messaging,
        transcriber,
        orchestrator,
    });

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
