// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN Gateway CLI
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port, broker on localhost:1883
//! mqttsn-gateway
//!
//! # Custom listener and broker
//! mqttsn-gateway --port 10000 --broker-host broker.local --broker-port 1883
//!
//! # Using configuration file
//! mqttsn-gateway --config gateway.toml
//!
//! # Generate / check a configuration file
//! mqttsn-gateway gen-config --output gateway.toml
//! mqttsn-gateway validate --config gateway.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use mqttsn_gateway::{GatewayConfig, GatewayError, GatewayServer, MqttConnector};
use tracing_subscriber::EnvFilter;

/// MQTT-SN to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "mqttsn-gateway")]
#[command(about = "MQTT-SN Gateway - bridges UDP MQTT-SN clients to an MQTT broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP listen host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// UDP listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// MQTT broker host (overrides config)
    #[arg(long)]
    broker_host: Option<String>,

    /// MQTT broker port (overrides config)
    #[arg(long)]
    broker_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Handle subcommands
    if let Some(cmd) = args.command {
        init_logging(args.log_level.as_deref().unwrap_or("info"));
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;
    init_logging(&config.log_level);

    let server = GatewayServer::bind(config, Arc::new(MqttConnector)).await?;
    let gateway = server.gateway();

    println!("MQTT-SN Gateway v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!("Listening on {}", server.local_addr()?);
    println!(
        "Broker: {}:{}",
        gateway.config().broker.host,
        gateway.config().broker.port
    );
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
        }
    }
    gateway.shutdown();

    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> Result<GatewayConfig, GatewayError> {
    let mut config = match args.config {
        Some(ref path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };

    // Command line wins over the file
    if let Some(ref host) = args.host {
        config.gateway.host = host.clone();
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(ref host) = args.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GatewayConfig::default();
    config.broker.client_id_prefix = "sn-".into();
    config.add_predefined("sensor-01", 1, "sensors/sensor-01/temperature");
    config.add_predefined("sensor-01", 2, "sensors/sensor-01/humidity");

    let toml_str = toml::to_string_pretty(&config)?;

    let content = format!(
        r#"# MQTT-SN Gateway Configuration
# Generated by mqttsn-gateway gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match GatewayConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Listen: {}", config.listen_addr());
            println!("Broker: {}:{}", config.broker.host, config.broker.port);
            let predefined = config.predefined_topics();
            println!("Predefined topics: {} clients", predefined.len());
            for (client_id, topics) in &predefined {
                let mut ids: Vec<_> = topics.iter().collect();
                ids.sort();
                for (id, name) in ids {
                    println!("  [{}] {} -> {}", client_id, id, name);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
