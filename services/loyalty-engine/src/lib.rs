pub mod accounts;
pub mod accrual_client;
pub mod auth;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod ledgers;
pub mod metrics;
pub mod models;

pub use config::Config;
pub use errors::{ApiError, Result};
