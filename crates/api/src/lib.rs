// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! IdeaKit API Library
//!
//! HTTP surface for the IdeaKit billing engine: credits, checkout, kit
//! creation, Stripe webhooks and internal reconciliation routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;


pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
