use thiserror::Error;

use crate::{capture::CaptureError, runtime::conf::ConfError, sink::SinkError};

/// Main application error type for parley
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Configuration/startup errors
    #[error("configuration error: {0}")]
    Conf(#[from] ConfError),

    /// Capture device errors (open, filter)
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Raw send errors. Send reliability is a prerequisite, so these are
    /// fatal.
    #[error("send error: {0}")]
    Sink(#[from] SinkError),

    /// Result file / stdio errors
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Result with ParleyError
pub type Result<T> = std::result::Result<T, ParleyError>;
