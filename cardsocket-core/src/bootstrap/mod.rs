//! Bootstrap helpers for the cardsocket server

pub mod config;

pub use config::load_config;
