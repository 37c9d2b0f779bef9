pub mod cancel;
pub mod config;
pub mod env;
pub mod error;
pub mod events;
pub mod executor;
pub mod extract;
pub mod provision;
pub mod sandbox;
pub mod service;
pub mod toolkit;
pub mod transfer;

pub use error::{Error, Result};
