use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::Db;
use crate::services::conversation::BookingOrchestrator;
use crate::services::messaging::MessagingProvider;
use crate::services::transcription::Transcriber;

pub struct AppState {
    pub db: Db,
    pub config: AppConfig,
    pub messaging: Arc<dyn MessagingProvider>,
    pub transcriber: Option<Box<dyn Transcriber>>,
    pub orchestrator: BookingOrchestrator,
}
