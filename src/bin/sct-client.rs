use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use sct::host::{
    CONTAINER_PORT, ContainerSpec, DockerCli, ExternalContainer, HostRequest, ProxyExecutor,
    SctClient,
};

/// Sends one grading request to a plugin container and prints the report
#[derive(Parser, Debug)]
#[command(name = "sct-client", version, about, long_about = None)]
struct ClientArgs {
    /// JSON file holding the request; `-` reads standard input
    #[arg(long, short = 'r')]
    request: String,

    #[arg(long, default_value = "python")]
    plugin: String,

    /// Image tag; defaults to the settings version of the request
    #[arg(long)]
    plugin_version: Option<String>,

    /// Directory holding the plugin image's Dockerfile
    #[arg(long, default_value = ".")]
    build_context: PathBuf,

    #[arg(long, default_value = "sct")]
    prefix: String,

    #[arg(long)]
    network: Option<String>,

    #[arg(long, default_value_t = CONTAINER_PORT)]
    port: u16,

    /// Connect to an already running orchestrator instead of managing a container
    #[arg(long)]
    no_docker: bool,

    /// Host name used with `--no-docker`
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

fn read_request(path: &str) -> anyhow::Result<HostRequest> {
    let request = if path == "-" {
        serde_json::from_reader(std::io::BufReader::new(std::io::stdin()))?
    } else {
        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {path}"))?;
        serde_json::from_reader(std::io::BufReader::new(file))?
    };
    Ok(request)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("warn"));

    let args = ClientArgs::parse();
    let mut request = read_request(&args.request).context("Failed to read request")?;
    if request.settings_version.is_empty() {
        request.settings_version = sct::create_timestamp();
    }

    let response = if args.no_docker {
        let executor = ProxyExecutor::new(
            ExternalContainer::new(args.host),
            SctClient::default(),
            args.port,
        );
        executor.execute(&request).await
    } else {
        let spec = ContainerSpec {
            prefix: args.prefix,
            plugin: args.plugin,
            version: args
                .plugin_version
                .unwrap_or_else(|| request.settings_version.clone()),
            name: request.token.clone(),
            network: args.network,
            build_context: args.build_context,
        };
        let executor = ProxyExecutor::new(DockerCli::new(spec)?, SctClient::default(), args.port);
        executor.execute(&request).await
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
