//! # Leadflow Gateway
//! HTTP API built on Axum.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, build_router_from_arc, start};
