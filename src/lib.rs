#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod datatypes;
pub mod discovery;
pub mod error;
pub mod handler;
mod protocol;
pub mod scheduler;
#[cfg(feature = "async")]
pub mod tokio;
pub mod uri;

pub use discovery::discover;
pub use protocol::{DefaultProtocol, Protocol, Reply};

pub const BINDING_ID: &str = "iotivity";
pub const THING_TYPE: &str = "light";
pub const CHANNEL_POWER: &str = "power";
