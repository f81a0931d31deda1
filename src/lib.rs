pub mod config;
pub mod error;
pub mod exec;
pub mod host;
pub mod orchestrator;
pub mod protocol;
pub mod sandbox;
pub mod settings;

pub fn create_timestamp() -> String {
    use chrono::{SecondsFormat, Utc};
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
