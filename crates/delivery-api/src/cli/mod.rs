//! CLI command definitions for the `dsvc` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod config;
pub mod demo;
pub mod tables;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use delivery_types::config::{
    DeliveryConfig, TunnelConfig, TunnelRole, default_max_connections_per_address,
};

/// Run and inspect an in-process delivery service.
#[derive(Parser)]
#[command(name = "dsvc", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Path to the configuration file (defaults to ./delivery.toml).
    #[arg(long, global = true, env = "DSVC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the demo clients against a fresh service and print the registries.
    Demo(DemoArgs),

    /// Show the effective configuration.
    Config {
        /// Fail on a missing, malformed, or invalid file instead of using defaults.
        #[arg(long)]
        check: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Number of local clients.
    #[arg(long, default_value_t = 5)]
    pub clients: usize,

    /// Number of ticks to run; 0 runs until Ctrl+C.
    #[arg(long, default_value_t = 12)]
    pub ticks: u64,

    /// Milliseconds between ticks.
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,

    /// Simulated remote peers attached to the tunnel endpoint.
    #[arg(long, default_value_t = 0)]
    pub remote_peers: usize,

    #[command(flatten)]
    pub tunnel: TunnelArgs,
}

/// Tunnel overrides applied on top of the configuration file.
#[derive(Args, Debug, Clone, Default)]
pub struct TunnelArgs {
    /// Tunnel role: client or server.
    #[arg(long)]
    pub role: Option<TunnelRole>,

    /// Endpoint working directory.
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Bind address (server) or server address (client).
    #[arg(long)]
    pub address: Option<String>,

    #[arg(long)]
    pub data_port: Option<u16>,

    #[arg(long)]
    pub control_port: Option<u16>,

    /// First port handed to connecting clients (server only).
    #[arg(long)]
    pub clients_base_port: Option<u16>,

    /// Maximum connected clients (server only).
    #[arg(long)]
    pub max_clients: Option<u32>,
}

impl TunnelArgs {
    fn any_set(&self) -> bool {
        self.role.is_some()
            || self.dir.is_some()
            || self.address.is_some()
            || self.data_port.is_some()
            || self.control_port.is_some()
            || self.clients_base_port.is_some()
            || self.max_clients.is_some()
    }

    /// Merge the flags into `config.tunnel` and validate the result.
    pub fn apply(&self, config: &mut DeliveryConfig) -> Result<()> {
        if !self.any_set() {
            return Ok(());
        }

        let mut tunnel = match config.tunnel.take() {
            Some(tunnel) => tunnel,
            None => {
                let (Some(role), Some(address), Some(data_port), Some(control_port)) = (
                    self.role,
                    self.address.clone(),
                    self.data_port,
                    self.control_port,
                ) else {
                    bail!(
                        "no [tunnel] section in the config: --role, --address, --data-port and --control-port are required"
                    );
                };
                TunnelConfig {
                    role,
                    base_directory: self.dir.clone().unwrap_or_else(std::env::temp_dir),
                    address,
                    data_port,
                    control_port,
                    clients_base_port: None,
                    max_clients: None,
                    max_connections_per_address: default_max_connections_per_address(),
                }
            }
        };

        if let Some(role) = self.role {
            tunnel.role = role;
        }
        if let Some(dir) = &self.dir {
            tunnel.base_directory = dir.clone();
        }
        if let Some(address) = &self.address {
            tunnel.address = address.clone();
        }
        if let Some(port) = self.data_port {
            tunnel.data_port = port;
        }
        if let Some(port) = self.control_port {
            tunnel.control_port = port;
        }
        if self.clients_base_port.is_some() {
            tunnel.clients_base_port = self.clients_base_port;
        }
        if self.max_clients.is_some() {
            tunnel.max_clients = self.max_clients;
        }

        tunnel.validate()?;
        config.tunnel = Some(tunnel);
        Ok(())
    }
}
