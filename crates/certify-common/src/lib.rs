pub mod config;

pub use config::{EnvironmentSettings, ProtocolKind};
