pub mod accessor;
pub mod blob;
pub mod display;
pub mod error;
pub mod events;
pub mod filter;
pub mod ident;
pub mod metamodel;
pub mod modification;
pub mod page_token;
pub mod physical;
pub mod query_info;
pub mod repository;
pub mod settings;
pub mod tasks;
pub mod types;

pub use error::{ServiceError, ValidationError};
pub use settings::EngineSettings;
