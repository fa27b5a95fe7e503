pub mod config;
pub mod diff;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod state;
pub mod trigger;
