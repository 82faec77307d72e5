//! Error types for kokoro-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Token count (boundary tokens included) exceeds the synthesis cap.
    ///
    /// Raised before any tensor is allocated; the caller can split the input.
    #[error("input too long: {tokens} tokens, at most {max} allowed")]
    InputTooLong { tokens: usize, max: usize },

    /// A weight is missing or its shape does not match the architecture,
    /// or the configuration is self-inconsistent.
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// An internal invariant failed (durations, alignment, output length).
    #[error("numerical invariant violated: {0}")]
    NumericalInvariant(String),

    /// Malformed caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Audio processing error (STFT, WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
