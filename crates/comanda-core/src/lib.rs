//! # comanda-core
//!
//! Core types, traits, configuration, and error handling for the Comanda
//! food-truck gateway.

pub mod config;
pub mod error;
pub mod message;
pub mod sanitize;
pub mod traits;

pub use config::shellexpand;
pub use error::ComandaError;
