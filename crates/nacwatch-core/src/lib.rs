pub mod change;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fsio;
pub mod generator;
pub mod health;
pub mod history;
pub mod keys;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod retention;
pub mod retry;
pub mod vault;

pub use error::{Error, ErrorCategory, Result};
