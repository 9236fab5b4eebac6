// Error types shared across the binary surface - some variants for future
// error conditions

#![allow(dead_code)]

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NifflerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("No model named '{0}' in configuration")]
    UnknownModel(String),

    #[error("Agent definition error: {0}")]
    AgentDefinition(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, NifflerError>;
