pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{topics, Message};
pub use paths::Paths;
pub use types::{ComponentKind, ComponentMetadata, ComponentRecord, Registry};
