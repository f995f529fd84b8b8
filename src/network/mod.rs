//! Network services

pub mod server;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind: {0}")]
    Bind(String),
}
