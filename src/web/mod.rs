//! The web module for handling the Axum API.
//! This file declares the other files in this directory as sub-modules.

pub mod api;
pub mod auth;
pub mod models;

pub use api::{create_router, AppState, AppStateInner};
