//! Common types shared by the console API workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
