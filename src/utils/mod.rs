//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use error::NlmError;
pub use print::{logger_init, ME};

pub(crate) use safetcp::{read_frame, write_frame};
