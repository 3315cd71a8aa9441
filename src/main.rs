//! dnsgate: forwarding DNS service
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! dnsgate
//!
//! # Run with a custom configuration
//! dnsgate -c /path/to/config.json
//!
//! # Write a default configuration and exit
//! dnsgate --generate-config
//!
//! # Validate the configuration and exit
//! dnsgate -c config.json --check-config
//!
//! # Log level via the environment
//! DNSGATE_LOG=debug dnsgate
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dnsgate::config::{
    load_config, Config, Protocol, ServerConfig, ServerGroupConfig, UpstreamConfig,
};
use dnsgate::errcoll::LogCollector;
use dnsgate::geoip::StaticGeoIp;
use dnsgate::service::DnsService;

/// Default configuration path
const DEFAULT_CONFIG_PATH: &str = "/etc/dnsgate/config.json";

/// How long shutdown waits for in-flight queries
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Write a default configuration and exit
    generate_config: bool,
    /// Validate the configuration and exit
    check_config: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut generate_config = false;
        let mut check_config = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().context("missing value for --config")?;
                    config_path = PathBuf::from(path);
                }
                "--generate-config" => generate_config = true,
                "--check-config" => check_config = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }

        Ok(Self {
            config_path,
            generate_config,
            check_config,
        })
    }
}

fn print_usage() {
    println!("dnsgate {}", dnsgate::VERSION);
    println!();
    println!("USAGE:");
    println!("    dnsgate [-c <config.json>] [--generate-config] [--check-config]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <path>    Configuration file (default: {DEFAULT_CONFIG_PATH})");
    println!("        --generate-config  Write a default configuration to the config path");
    println!("        --check-config     Validate the configuration and exit");
    println!("    -h, --help             Print this help");
}

/// A starting-point configuration for `--generate-config`
fn default_config() -> Config {
    Config::new().with_group(
        ServerGroupConfig::new(
            "default",
            UpstreamConfig::new("9.9.9.10:53".parse().expect("valid default upstream"))
                .with_fallback("149.112.112.10:53".parse().expect("valid default fallback")),
        )
        .with_server(ServerConfig::new(
            "dns-udp",
            Protocol::Udp,
            vec!["0.0.0.0:53".parse().expect("valid default bind")],
        ))
        .with_server(ServerConfig::new(
            "dns-tcp",
            Protocol::Tcp,
            vec!["0.0.0.0:53".parse().expect("valid default bind")],
        )),
    )
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env("DNSGATE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {err}");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    if args.generate_config {
        let config = default_config();
        let json = serde_json::to_string_pretty(&config)?;
        std::fs::write(&args.config_path, json)
            .with_context(|| format!("writing {}", args.config_path.display()))?;
        info!(path = %args.config_path.display(), "wrote default configuration");
        return Ok(());
    }

    let config = load_config(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        info!("configuration is valid");
        return Ok(());
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(serve(config))
}

async fn serve(config: Config) -> Result<()> {
    info!(version = dnsgate::VERSION, "starting dnsgate");

    let service = DnsService::build(
        &config,
        Arc::new(StaticGeoIp::new()),
        Arc::new(LogCollector::new()),
        None,
    )
    .await?;

    service.start().await?;
    for (name, proto, addr) in service.server_addrs() {
        info!(server = name, proto = %proto, addr = %addr, "listening");
    }

    signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    service.shutdown(SHUTDOWN_TIMEOUT).await?;
    info!("bye");

    Ok(())
}
