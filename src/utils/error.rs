//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for ringstore.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RingStoreError(pub String);

impl RingStoreError {
    /// Constructs an error from anything printable.
    pub fn msg(e: impl ToString) -> Self {
        RingStoreError(e.to_string())
    }
}

impl fmt::Display for RingStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for RingStoreError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `RingStoreError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RingStoreError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RingStoreError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);
impl_from_error!(tokio::sync::watch::error::SendError<bool>);

// All mpsc payload types funnel through one generic impl; the payload
// itself is not part of the error message.
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RingStoreError {
    fn from(_e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RingStoreError("mpsc channel closed".into())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = RingStoreError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = RingStoreError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_send_error() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<u32>();
        drop(rx);
        let e = RingStoreError::from(tx.send(7).unwrap_err());
        assert!(e.0.contains("closed"));
    }
}
