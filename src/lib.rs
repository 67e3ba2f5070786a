pub mod app;
pub mod backup;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod gcp;
pub mod iam;
pub mod location;
pub mod logging;
pub mod restore;
pub mod secret;
pub mod shutdown;
pub mod stats;
pub mod types;
pub mod waiter;

pub use error::{Error, Result};
