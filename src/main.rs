use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod auth;
mod client;
mod constants;
mod protocol;
mod server;
#[cfg(test)]
mod simulations;

#[derive(Parser, Debug)]
#[command(
    name = "mmar",
    version = env!("CARGO_PKG_VERSION"),
    about = "mmar is an HTTP tunnel that exposes your localhost to the world on a public URL."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "MMAR__LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a mmar server. Run this on your publicly reachable server if you're self-hosting mmar.
    Server {
        /// Define port where mmar will bind to and run on server for HTTP requests.
        #[arg(long, default_value_t = constants::SERVER_HTTP_PORT, env = "MMAR__HTTP_PORT")]
        http_port: u16,

        /// Define port where mmar will bind to and run on server for TCP connections.
        #[arg(long, default_value_t = constants::SERVER_TCP_PORT, env = "MMAR__TCP_PORT")]
        tcp_port: u16,

        /// JSON file of API keys and their tunnel limits.
        #[arg(long, env = "MMAR__API_KEYS_FILE")]
        api_keys_file: Option<PathBuf>,
    },

    /// Runs a mmar client. Run this on your machine to expose your localhost on a public URL.
    Client {
        /// Define the port where your local dev server is running to expose through mmar.
        #[arg(long, default_value_t = constants::CLIENT_LOCAL_PORT, env = "MMAR__LOCAL_PORT")]
        local_port: u16,

        /// Define port of mmar HTTP server to make requests through the tunnel.
        #[arg(long, default_value_t = constants::TUNNEL_HTTP_PORT, env = "MMAR__TUNNEL_HTTP_PORT")]
        tunnel_http_port: u16,

        /// Define port of mmar TCP server for client to connect to, creating a tunnel.
        #[arg(long, default_value_t = constants::SERVER_TCP_PORT, env = "MMAR__TUNNEL_TCP_PORT")]
        tunnel_tcp_port: u16,

        /// Define host domain of mmar server for client to connect to.
        #[arg(long, default_value = constants::TUNNEL_HOST, env = "MMAR__TUNNEL_HOST")]
        tunnel_host: String,

        /// Custom UDP DNS server (host:port) for resolving the local destination.
        #[arg(long, env = "MMAR__CUSTOM_DNS")]
        custom_dns: Option<String>,

        /// DER-encoded certificate to add to the forwarding trust store.
        #[arg(long, env = "MMAR__CUSTOM_CERT")]
        custom_cert: Option<PathBuf>,

        /// Request a specific subdomain instead of an auto-assigned one.
        #[arg(long, env = "MMAR__CUSTOM_NAME")]
        custom_name: Option<String>,

        /// API key for deployments provisioned with an api-keys file.
        #[arg(long, env = "MMAR__API_KEY")]
        api_key: Option<String>,
    },

    /// Prints the installed version of mmar.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Server { http_port, tcp_port, api_keys_file } => {
            server::run(server::ConfigOptions { http_port, tcp_port, api_keys_file }).await
        }
        Commands::Client {
            local_port,
            tunnel_http_port,
            tunnel_tcp_port,
            tunnel_host,
            custom_dns,
            custom_cert,
            custom_name,
            api_key,
        } => {
            client::run(client::ConfigOptions {
                local_port,
                tunnel_http_port,
                tunnel_tcp_port,
                tunnel_host,
                custom_dns,
                custom_cert,
                custom_name,
                api_key,
            })
            .await
        }
        Commands::Version => {
            println!("mmar version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
