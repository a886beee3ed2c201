pub mod cli;
pub mod collector;
pub mod error;
pub mod flaky;
pub mod ingest;
pub mod model;
pub mod queries;
pub mod query;
pub mod store;

pub use error::{FlakrsError, Result};
