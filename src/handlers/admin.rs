use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::db::{self, queries};
use crate::errors::AppError;
use crate::models::{BookingRecord, SlotRow};
use crate::state::AppState;

fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), AppError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or("");
    if expected_token.is_empty() || token != expected_token {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("invalid date (expected YYYY-MM-DD): {raw}")))
}

// GET /api/admin/status
#[derive(Serialize)]
pub struct StatusResponse {
    business_name: String,
    timezone: String,
    today: NaiveDate,
    open_slots: i64,
    claimed_slots: i64,
    booked_slots: i64,
    bookings: i64,
    active_conversations: usize,
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, AppError> {
    check_auth(&headers, &state.config.admin_token)?;

    let stats = {
        let conn = db::lock(&state.db)?;
        queries::get_store_stats(&conn)?
    };
    let active_conversations = state.orchestrator.sessions().count().await?;

    Ok(Json(StatusResponse {
        business_name: state.config.business_name.clone(),
        timezone: state.config.timezone.name().to_string(),
        today: chrono::Utc::now()
            .with_timezone(&state.config.timezone)
            .date_naive(),
        open_slots: stats.open_slots,
        claimed_slots: stats.claimed_slots,
        booked_slots: stats.booked_slots,
        bookings: stats.bookings,
        active_conversations,
    }))
}

// GET /api/admin/bookings
#[derive(Deserialize)]
pub struct BookingsQuery {
    pub date: Option<String>,
    pub limit: Option<i64>,
}

pub async fn get_bookings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BookingsQuery>,
) -> Result<Json<Vec<BookingRecord>>, AppError> {
    check_auth(&headers, &state.config.admin_token)?;

    let date = query.date.as_deref().map(parse_date).transpose()?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let bookings = {
        let conn = db::lock(&state.db)?;
        queries::list_bookings(&conn, date, limit)?
    };
    Ok(Json(bookings))
}

// GET /api/admin/slots
#[derive(Deserialize)]
pub struct SlotsQuery {
    pub date: Option<String>,
}

pub async fn get_slots(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SlotsQuery>,
) -> Result<Json<Vec<SlotRow>>, AppError> {
    check_auth(&headers, &state.config.admin_token)?;

    let date = query.date.as_deref().map(parse_date).transpose()?;
    let slots = {
        let conn = db::lock(&state.db)?;
        queries::list_slots(&conn, date)?
    };
    Ok(Json(slots))
}

// POST /api/admin/slots
#[derive(Deserialize)]
pub struct CreateSlotsRequest {
    pub date: String,
    pub times: Vec<String>,
    pub service: Option<String>,
    pub notes: Option<String>,
}

pub async fn create_slots(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSlotsRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    check_auth(&headers, &state.config.admin_token)?;

    let date = parse_date(&body.date)?;
    if body.times.is_empty() {
        return Err(AppError::BadRequest("times must not be empty".to_string()));
    }
    let times = body
        .times
        .iter()
        .map(|t| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .map_err(|_| AppError::BadRequest(format!("invalid time (expected HH:MM): {t}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let ids = {
        let conn = db::lock(&state.db)?;
        let mut ids = Vec::with_capacity(times.len());
        for time in times {
            ids.push(queries::insert_slot(
                &conn,
                date,
                time,
                body.service.as_deref(),
                body.notes.as_deref(),
            )?);
        }
        ids
    };

    tracing::info!(%date, count = ids.len(), "slots created");
    Ok(Json(serde_json::json!({ "ok": true, "created": ids })))
}

// POST /api/admin/slots/:id/release
pub async fn release_slot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    check_auth(&headers, &state.config.admin_token)?;

    let released = {
        let conn = db::lock(&state.db)?;
        queries::force_release_slot(&conn, id)?
    };

    if released {
        tracing::info!(slot_id = id, "slot released by operator");
        Ok(Json(serde_json::json!({ "ok": true })))
    } else {
        Err(AppError::NotFound(format!("no releasable slot {id}")))
    }
}
