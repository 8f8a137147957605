//! CLI argument parsing for the gcaas binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gcaas", about = "Geocoding-as-a-service backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start all service roles: edge, geocoder, batch ingress and worker pool
    /// (default if no subcommand given)
    Serve,
}
