pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;

pub use error::LineageError;
pub use models::*;
pub use services::*;
