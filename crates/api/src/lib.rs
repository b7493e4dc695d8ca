#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CareBill API Library
//!
//! HTTP surface of the CareBill billing engine: plan listing, purchases,
//! subscription transitions, refunds, entitlements and Stripe webhooks.

pub mod actor;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use actor::Actor;
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
