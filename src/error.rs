//! Error types for the Scatha analysis crate.
//!
//! Only the loader boundary and configuration handling can fail hard. Problems
//! found while analyzing code are recorded as diagnostics instead, see
//! [`crate::core::diagnostic`].

use thiserror::Error;

/// Main error type for Scatha operations.
#[derive(Debug, Error)]
pub enum ScathaError {
    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The input ended before a complete header or record could be read
    #[error("Truncated input at offset {offset:#x}: expected {expected} bytes, got {actual}")]
    TruncatedHeader {
        offset: usize,
        expected: usize,
        actual: usize,
    },

    /// Magic bytes did not match any supported format
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A record was structurally invalid
    #[error("Malformed record {record:#04x} at offset {offset:#x}: {message}")]
    MalformedRecord {
        record: u8,
        offset: usize,
        message: String,
    },

    /// A record type this loader does not understand
    #[error("Unsupported record {record:#04x} at offset {offset:#x}")]
    UnsupportedRecord { record: u8, offset: usize },

    /// A fixup location type outside the 16-bit model
    #[error("Unsupported fixup location type {location} at offset {offset:#x}")]
    UnsupportedFixup { location: u8, offset: usize },

    /// Fixups within one segment were unsorted or overlapped
    #[error("Overlapping fixups at {first:#x} and {second:#x}")]
    OverlappingFixups { first: usize, second: usize },

    /// An index into a name, segment, group or external table was out of range
    #[error("Invalid {table} index {index}")]
    InvalidIndex { table: &'static str, index: usize },

    /// Configuration could not be parsed or serialized
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for Scatha operations
pub type Result<T> = std::result::Result<T, ScathaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScathaError::InvalidSignature("expected MZ".to_string());
        assert_eq!(err.to_string(), "Invalid signature: expected MZ");

        let err = ScathaError::MalformedRecord {
            record: 0x98,
            offset: 0x1234,
            message: "segment length missing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed record 0x98 at offset 0x1234: segment length missing"
        );

        let err = ScathaError::InvalidIndex {
            table: "segment",
            index: 7,
        };
        assert_eq!(err.to_string(), "Invalid segment index 7");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ScathaError = io.into();
        assert!(matches!(err, ScathaError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
