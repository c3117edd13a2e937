use std::path::PathBuf;

use clap::{Parser, Subcommand};
use spyglass::config::ServiceConfig;
use spyglass::policy::{compile, ConfigDoc};
use spyglass::server::{self, ServiceState};
use tracing::Level;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.spyglass/spyglass.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long, global = true)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hijack-detection pipeline service.
    Serve {
        /// Control plane bind address, overrides the config file.
        #[clap(long)]
        host: Option<String>,

        /// Control plane port, overrides the config file and REST_PORT.
        #[clap(long, short)]
        port: Option<u16>,
    },

    /// Validate a configuration document without installing it.
    Validate {
        /// Path to a YAML or JSON configuration document.
        #[clap(name = "FILE")]
        file: PathBuf,

        /// Pretty-print JSON output
        #[clap(long)]
        pretty: bool,
    },
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = match ServiceConfig::new(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return;
        }
    };

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.rest_port = port;
            }

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    eprintln!("ERROR: {e}");
                    return;
                }
            };
            let result = runtime.block_on(async {
                let state = ServiceState::new(config);
                server::fetch_initial_config(&state).await;
                server::start_server(state).await
            });
            if let Err(e) = result {
                eprintln!("ERROR: {e}");
            }
        }

        Commands::Validate { file, pretty } => {
            let text = match std::fs::read_to_string(&file) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("ERROR: cannot read {}: {e}", file.display());
                    return;
                }
            };
            // serde_yaml parses JSON documents as well
            let doc: ConfigDoc = match serde_yaml::from_str(&text) {
                Ok(doc) => doc,
                Err(e) => {
                    eprintln!("ERROR: invalid configuration document: {e}");
                    return;
                }
            };
            match compile(&doc) {
                Ok(compiled) => {
                    let summary = serde_json::json!({
                        "timestamp": compiled.timestamp,
                        "rules": doc.rules.len(),
                        "configured_prefix_count": compiled.configured_prefix_count,
                        "monitored_prefixes": compiled.monitored_prefixes,
                        "monitors": compiled.monitors,
                    });
                    let output = if pretty {
                        serde_json::to_string_pretty(&summary)
                    } else {
                        serde_json::to_string(&summary)
                    };
                    match output {
                        Ok(output) => println!("{output}"),
                        Err(e) => eprintln!("ERROR: {e}"),
                    }
                }
                Err(e) => {
                    eprintln!("ERROR: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
