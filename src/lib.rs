pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod history;
pub mod logging;

pub use error::{Error, Result};
