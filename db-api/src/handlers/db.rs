use axum::extract::{Path, State};
use axum::{http::StatusCode, Json};
use serde_derive::{Deserialize, Serialize};
use tracing::error;

use crate::database::Entry;

use super::app::AppState;

pub const INDEX_MESSAGE: &str = "Rust API is running!";
pub const QUERY_ERROR: &str = "Error querying database!";
pub const INSERT_ERROR: &str = "Error inserting!";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

pub async fn index() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: INDEX_MESSAGE.to_owned(),
    })
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Entry>>, HandlerError> {
    let entries = state
        .db
        .list_entries()
        .await
        .map_err(|err| internal_error(err, QUERY_ERROR))?;

    Ok(Json(entries))
}

pub async fn add(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, HandlerError> {
    state
        .db
        .insert_entry(&name)
        .await
        .map_err(|err| internal_error(err, INSERT_ERROR))?;

    Ok(Json(MessageResponse {
        message: format!("Successfully inserted: {}", name),
    }))
}

/// Log the full error, hand the client only the fixed message.
fn internal_error<E>(err: E, message: &str) -> HandlerError
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}
