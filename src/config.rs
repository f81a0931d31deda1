use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::exec::PythonConfig;
use crate::orchestrator::ServerOptions;
use crate::protocol::DEFAULT_PORT;

#[derive(Parser, Debug, Default)]
#[command(name = "sct", version, about = "Sandboxed code-test orchestrator", long_about = None)]
pub struct CliArgs {
    /// Path to an optional JSON configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Address to listen on, e.g. 0.0.0.0:1700
    #[arg(long)]
    pub bind: Option<String>,

    /// Concurrent connections admitted before new ones are rejected
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Directory holding sandbox rules and per-request directories
    #[arg(long)]
    pub work_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration file, if any, and apply command-line overrides
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };

        if let Some(bind) = &self.bind {
            config.bind = bind.clone();
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub max_connections: usize,
    pub work_dir: PathBuf,
    /// Seconds
    pub container_timeout: f64,
    /// Seconds
    pub code_timeout: f64,
    /// Seconds
    pub driver_timeout: f64,
    pub python: String,
    pub pytest: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_connections: 20,
            work_dir: PathBuf::from("."),
            container_timeout: 600.0,
            code_timeout: 50.0,
            driver_timeout: 60.0,
            python: "python3".to_string(),
            pytest: "pytest".to_string(),
        }
    }
}

fn seconds(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

impl Config {
    pub fn server_options(&self) -> ServerOptions {
        let defaults = Config::default();
        ServerOptions {
            max_connections: self.max_connections.max(1),
            container_timeout: seconds(self.container_timeout, defaults.container_timeout),
            code_timeout: seconds(self.code_timeout, defaults.code_timeout),
            ..Default::default()
        }
    }

    pub fn python_config(&self) -> PythonConfig {
        PythonConfig {
            work_dir: self.work_dir.clone(),
            python: self.python.clone(),
            pytest: self.pytest.clone(),
            driver_timeout: seconds(self.driver_timeout, Config::default().driver_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.bind, "127.0.0.1:1700".to_string());
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.python, "python3");
        assert_eq!(
            config.server_options().code_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs {
            config_path: Some("data/example.json".to_string()),
            bind: Some("0.0.0.0:9000".to_string()),
            ..Default::default()
        };
        let config = cli.to_config().unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = CliArgs::default().to_config().unwrap();
        assert_eq!(config, Config::default());

        let options = config.server_options();
        assert_eq!(options.max_connections, 20);
        assert_eq!(options.container_timeout, Duration::from_secs(600));
        assert_eq!(options.code_timeout, Duration::from_secs(50));
        assert_eq!(config.python_config().driver_timeout, Duration::from_secs(60));
    }
}
