//! Marketplace API Library
//!
//! Order-lifecycle core of the marketplace backend: cart to order
//! conversion under row locks, inventory accounting, coupon redemption,
//! and payment gateway webhooks/reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod migrator;
pub mod services;
pub mod workers;

use axum::Router;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: events::EventSender,
    pub services: handlers::AppServices,
}

impl AppState {
    /// Wires services, gateways and shared state from a connection and a
    /// configuration. Used by the binary and by integration tests.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: events::EventSender,
        gateways: Arc<gateways::GatewayRegistry>,
    ) -> Self {
        let services = handlers::AppServices::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
            gateways,
        );
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}

/// Versioned API surface: carts, checkout/orders, payments, webhooks.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(handlers::carts::routes())
        .merge(handlers::orders::routes())
        .merge(handlers::payments::routes())
        .merge(handlers::webhooks::routes())
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_page() -> u64 {
    1
}
fn default_limit() -> u64 {
    20
}

// Common response wrappers
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn success_response_carries_data_and_timestamp() {
        let response = ApiResponse::success("ok");
        assert!(response.success);
        assert_eq!(response.data, Some("ok"));
        DateTime::parse_from_rfc3339(&response.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn error_response_carries_message() {
        let response = ApiResponse::<()>::error("oops".into());
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("oops"));
    }
}
