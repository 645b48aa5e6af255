use thiserror::Error;

/// Error type shared by all three inference engines.
///
/// The variants are deliberately coarse: callers distinguish the *kind* of
/// failure, while the attached message names the offending parameter or state.
/// Index corruption and similar internal inconsistencies are programming bugs
/// and assert instead of surfacing here.
#[derive(Error, Debug)]
pub enum StemmaError {
    /// An up-front reservation for engine scratch memory failed.
    #[error("out of memory")]
    OutOfMemory,

    /// An input violated a range or ordering precondition.
    #[error("bad parameter: {message}")]
    BadParam { message: String },

    /// A flag word contained bits no operation understands.
    #[error("unknown flags: {flags:#x}")]
    UnknownFlag { flags: u32 },

    /// A failure that fits no other category.
    #[error("{message}")]
    Generic { message: String },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StemmaError>;

impl StemmaError {
    /// Create a [`StemmaError::BadParam`] with a message
    pub fn bad_param(message: impl Into<String>) -> Self {
        Self::BadParam {
            message: message.into(),
        }
    }

    /// Create a [`StemmaError::Generic`] with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }
}
