mod app;
mod db;

pub use app::{app, instrument, routes, AppState};
pub use db::{ErrorResponse, MessageResponse};
