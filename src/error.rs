//! Bridge Error types

use std::path::PathBuf;

use thiserror::Error;

use crate::handle::HandleId;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Wrong type argument for '{option}': expected {expected}, got {found}")]
    TypeMismatch {
        option: String,
        expected: String,
        found: &'static str,
    },

    #[error("Value {value} for '{option}' is out of range [{min}, {max}]")]
    RangeError {
        option: String,
        value: i128,
        min: i128,
        max: i128,
    },

    #[error("Wrong value for '{option}': unknown constant '{value}'")]
    UnknownConstant { option: String, value: String },

    #[error("Operation is not supported yet: option {0}")]
    UnsupportedOption(i32),

    #[error("No such option: {0}")]
    UnknownOption(String),

    #[error("The file does not exist or permission denied: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Unable to import a key from the file: {}", path.display())]
    ImportError { path: PathBuf },

    #[error("Wrong type argument: {0}")]
    TypeError(String),

    #[error("{operation}: {message}")]
    Native {
        operation: &'static str,
        code: i32,
        message: String,
    },

    #[error("Handle {0} has already been released")]
    Released(HandleId),

    #[error("Invalid handle: {0}")]
    InvalidHandle(HandleId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Symbol the host signals this failure under
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::TypeMismatch { .. } => "type-mismatch",
            BridgeError::RangeError { .. } => "range-error",
            BridgeError::UnknownConstant { .. } => "unknown-constant",
            BridgeError::UnsupportedOption(_) => "unsupported-option",
            BridgeError::UnknownOption(_) => "unknown-option",
            BridgeError::NotFound { .. } => "not-found",
            BridgeError::ImportError { .. } => "import-error",
            BridgeError::TypeError(_) => "wrong-type-arg",
            BridgeError::Native { .. } => "native-error",
            BridgeError::Released(_) => "released-handle",
            BridgeError::InvalidHandle(_) => "invalid-handle",
            BridgeError::Io(_) => "io-error",
        }
    }
}

// Hosts receive errors as plain strings
impl serde::Serialize for BridgeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
