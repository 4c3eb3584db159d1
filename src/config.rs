use std::collections::BTreeSet;
use std::env;

use chrono::{NaiveDate, Weekday};
use chrono_tz::Tz;

use crate::errors::AppError;

/// Where conversation state lives between webhook calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub admin_token: String,

    pub whatsapp_access_token: String,
    pub whatsapp_phone_number_id: String,
    pub whatsapp_app_secret: String,
    pub whatsapp_verify_token: String,
    pub whatsapp_api_base: String,
    pub whatsapp_api_version: String,

    pub business_name: String,
    pub timezone: Tz,
    pub rest_days: Vec<Weekday>,
    pub extra_holidays: BTreeSet<NaiveDate>,
    pub days_offered: usize,
    pub slots_page_size: usize,
    pub appointment_minutes: i64,

    pub session_backend: SessionBackend,
    pub session_ttl_hours: i64,
    pub session_sweep_minutes: u64,

    pub public_base_url: String,
    pub support_contact: String,
    pub service_catalog_path: Option<String>,

    pub phone_country_code: String,
    pub phone_digits: usize,

    pub groq_api_key: String,
    pub groq_transcription_model: String,
}

/// List messages hold at most ten rows; two are reserved for page controls.
pub const MAX_SLOTS_PAGE_SIZE: usize = 8;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "slotbot.db".to_string(),
            admin_token: "changeme".to_string(),
            whatsapp_access_token: String::new(),
            whatsapp_phone_number_id: String::new(),
            whatsapp_app_secret: String::new(),
            whatsapp_verify_token: "verify-me".to_string(),
            whatsapp_api_base: "https://graph.facebook.com".to_string(),
            whatsapp_api_version: "v21.0".to_string(),
            business_name: "Estudio Contable".to_string(),
            timezone: chrono_tz::America::La_Paz,
            rest_days: vec![Weekday::Sat, Weekday::Sun],
            extra_holidays: BTreeSet::new(),
            days_offered: 7,
            slots_page_size: MAX_SLOTS_PAGE_SIZE,
            appointment_minutes: 30,
            session_backend: SessionBackend::Sqlite,
            session_ttl_hours: 24,
            session_sweep_minutes: 15,
            public_base_url: String::new(),
            support_contact: "soporte@example.com".to_string(),
            service_catalog_path: None,
            phone_country_code: "591".to_string(),
            phone_digits: 8,
            groq_api_key: String::new(),
            groq_transcription_model: "whisper-large-v3".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let timezone = match env::var("BUSINESS_TIMEZONE") {
            Ok(v) => v
                .parse::<Tz>()
                .map_err(|_| AppError::Config(format!("unknown BUSINESS_TIMEZONE: {v}")))?,
            Err(_) => defaults.timezone,
        };

        let rest_days = match env::var("REST_DAYS") {
            Ok(v) => parse_rest_days(&v)?,
            Err(_) => defaults.rest_days,
        };

        let extra_holidays = match env::var("EXTRA_HOLIDAYS") {
            Ok(v) => parse_holidays(&v)?,
            Err(_) => defaults.extra_holidays,
        };

        let session_backend = match env::var("SESSION_BACKEND").as_deref() {
            Ok("memory") => SessionBackend::Memory,
            Ok("sqlite") | Err(_) => SessionBackend::Sqlite,
            Ok(other) => {
                return Err(AppError::Config(format!(
                    "SESSION_BACKEND must be memory or sqlite, got {other}"
                )))
            }
        };

        let slots_page_size = parse_or("SLOTS_PAGE_SIZE", defaults.slots_page_size);
        if slots_page_size == 0 || slots_page_size > MAX_SLOTS_PAGE_SIZE {
            return Err(AppError::Config(format!(
                "SLOTS_PAGE_SIZE must be between 1 and {MAX_SLOTS_PAGE_SIZE}"
            )));
        }

        let days_offered = parse_or("DAYS_OFFERED", defaults.days_offered);
        if days_offered == 0 || days_offered > 10 {
            return Err(AppError::Config(
                "DAYS_OFFERED must be between 1 and 10".to_string(),
            ));
        }

        Ok(Self {
            port: parse_or("PORT", defaults.port),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            admin_token: env::var("ADMIN_TOKEN").unwrap_or(defaults.admin_token),
            whatsapp_access_token: env::var("WHATSAPP_ACCESS_TOKEN").unwrap_or_default(),
            whatsapp_phone_number_id: env::var("WHATSAPP_PHONE_NUMBER_ID").unwrap_or_default(),
            whatsapp_app_secret: env::var("WHATSAPP_APP_SECRET").unwrap_or_default(),
            whatsapp_verify_token: env::var("WHATSAPP_VERIFY_TOKEN")
                .unwrap_or(defaults.whatsapp_verify_token),
            whatsapp_api_base: env::var("WHATSAPP_API_BASE").unwrap_or(defaults.whatsapp_api_base),
            whatsapp_api_version: env::var("WHATSAPP_API_VERSION")
                .unwrap_or(defaults.whatsapp_api_version),
            business_name: env::var("BUSINESS_NAME").unwrap_or(defaults.business_name),
            timezone,
            rest_days,
            extra_holidays,
            days_offered,
            slots_page_size,
            appointment_minutes: parse_or("APPOINTMENT_MINUTES", defaults.appointment_minutes),
            session_backend,
            session_ttl_hours: parse_or("SESSION_TTL_HOURS", defaults.session_ttl_hours),
            session_sweep_minutes: parse_or("SESSION_SWEEP_MINUTES", defaults.session_sweep_minutes),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            support_contact: env::var("SUPPORT_CONTACT").unwrap_or(defaults.support_contact),
            service_catalog_path: env::var("SERVICE_CATALOG_PATH").ok(),
            phone_country_code: env::var("PHONE_COUNTRY_CODE")
                .unwrap_or(defaults.phone_country_code),
            phone_digits: parse_or("PHONE_DIGITS", defaults.phone_digits),
            groq_api_key: env::var("GROQ_API_KEY").unwrap_or_default(),
            groq_transcription_model: env::var("GROQ_TRANSCRIPTION_MODEL")
                .unwrap_or(defaults.groq_transcription_model),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn parse_rest_days(raw: &str) -> Result<Vec<Weekday>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Weekday>()
                .map_err(|_| AppError::Config(format!("invalid weekday in REST_DAYS: {s}")))
        })
        .collect()
}

pub fn parse_holidays(raw: &str) -> Result<BTreeSet<NaiveDate>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| AppError::Config(format!("invalid date in EXTRA_HOLIDAYS: {s}")))
        })
        .collect()
}
