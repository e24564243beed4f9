pub mod api;
pub mod attributes;
pub mod config;
pub mod families;
pub mod peer;
pub mod pipeline;
pub mod routes;
pub mod speaker;
pub mod tables;
pub mod utils;

pub use config::ServerConfig;
pub use families::{Families, Family};
pub use speaker::{Speaker, SpeakerError};
