//! portmux gateway binary
//!
//! Usage: portmux [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Generate a sample configuration
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use portmux::log::Logger;
use portmux::proxy::NetPiperDialer;
use portmux::server::{Forward, GatewayConfig, GatewayConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_gateway(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"portmux - SOCKS5 / HTTP proxy / WebSocket relay gateway

USAGE:
    portmux [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a sample configuration
    -h, --help              Print help information

LISTEN SCHEMES:
    socks://host:port       SOCKS5
    proxy://host:port       SOCKS5 and HTTP proxy on one port
    ws://host:port          WebSocket tunnel (target in the _uri query)
    tcp://host:port         every connection goes to the router as-is
                            (tcp4:// and tcp6:// are accepted aliases)

EXAMPLES:
    Generate a configuration:
        portmux --generate > portmux.toml

    Run the gateway:
        portmux --config portmux.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = GatewayConfigFile::from_config(&GatewayConfig::sample());

    println!("# portmux configuration");
    println!("# ${{HOST}} in a router is replaced by the requested target");
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);

    Ok(())
}

async fn run_gateway(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let config_file: GatewayConfigFile = toml::from_str(&content)?;
    let config = config_file.to_config().map_err(|e: String| anyhow::anyhow!(e))?;

    config.validate().map_err(|e: String| anyhow::anyhow!(e))?;

    let log = Logger::new("portmux", config.log_level);
    let forward = Forward::from_config(&config, Arc::new(NetPiperDialer::new()), log);

    let addrs = forward.start_all(&config).await?;
    tracing::info!("{} forward(s) running", addrs.len());
    for info in forward.forwards() {
        tracing::info!("  {} {} -> {}", info.name, info.local_addr, info.router);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    forward.stop().await;
    tracing::info!("\n{}", forward.metrics().format_report());

    Ok(())
}
