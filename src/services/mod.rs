pub mod dispatch;
pub mod extractor;
pub mod log_locator;
pub mod log_parser;
pub mod record_builder;
pub mod transport; // SFTP access to remote workflow runners

pub use dispatch::*;
pub use extractor::*;
pub use log_locator::*;
pub use log_parser::*;
pub use record_builder::*;
