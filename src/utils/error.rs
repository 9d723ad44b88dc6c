//! Crate-wide error type.

use std::error::Error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Error of a lock manager construction, configuration or collaborator
/// call. Protocol outcomes are replies, not errors.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NlmError(pub(crate) String);

impl NlmError {
    pub fn msg(msg: impl ToString) -> Self {
        NlmError(msg.to_string())
    }
}

impl fmt::Display for NlmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for NlmError {}

// Conversions keep only the source error's message.
macro_rules! nlm_error_from {
    (generic $($error:ty),+ $(,)?) => {
        $(impl<T> From<$error> for NlmError {
            fn from(e: $error) -> Self {
                NlmError(e.to_string())
            }
        })+
    };
    ($($error:ty),+ $(,)?) => {
        $(impl From<$error> for NlmError {
            fn from(e: $error) -> Self {
                NlmError(e.to_string())
            }
        })+
    };
}

nlm_error_from!(
    io::Error,
    num::ParseIntError,
    net::AddrParseError,
    rmp_serde::encode::Error,
    rmp_serde::decode::Error,
    toml::de::Error,
    tokio::time::error::Elapsed,
);

nlm_error_from!(generic
    tokio::sync::mpsc::error::SendError<T>,
    tokio::sync::watch::error::SendError<T>,
);
