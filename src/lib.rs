pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod nats_consumer;
pub mod reports;
pub mod retry;
pub mod services;

pub use config::Config;
pub use errors::{CreditTrackerError, Result};
pub use ledger::Ledger;
