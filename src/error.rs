use std::io;

use thiserror::Error;

/// Errors surfaced by construction and configuration paths.
///
/// I/O errors on established connections are never returned through this
/// type; they are recovered at the connection level and delivered through
/// the close path.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be parsed or failed validation.
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
