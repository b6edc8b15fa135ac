//! Common types shared by the redeem-code checker crates

mod secret;
mod error;

pub use secret::{Secret, preview};
pub use error::{Error, Result};
