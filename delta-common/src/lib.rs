pub mod blob;
pub mod bus;
pub mod codec;
pub mod config;
pub mod health;
pub mod mapping;
pub mod metrics;
pub mod record;
pub mod store;
pub mod transform;

pub use mapping::MappingSpec;
pub use record::{Record, StateKey};
pub use transform::{transform, ConversionError};
