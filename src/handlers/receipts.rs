use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::db::{self, queries};
use crate::errors::AppError;
use crate::state::AppState;

// GET /receipts/:booking_id
pub async fn download_receipt(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Response, AppError> {
    let booking_id = raw_id.strip_suffix(".ics").unwrap_or(&raw_id);

    let booking = {
        let conn = db::lock(&state.db)?;
        queries::get_booking_by_id(&conn, booking_id)?
    }
    .ok_or_else(|| AppError::NotFound("booking not found".to_string()))?;

    let receipt = state.orchestrator.receipts().generate(&booking).await?;

    Ok((
        [
            (header::CONTENT_TYPE, receipt.content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", receipt.filename),
            ),
        ],
        receipt.bytes,
    )
        .into_response())
}
