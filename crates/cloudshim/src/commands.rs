//! CLI commands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cloudshim - send Gemini-format requests through the cloud code backend
#[derive(Parser, Debug)]
#[command(name = "cloudshim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (searched in the working directory and ~/.config/cloudshim if omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log as JSON lines instead of text
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one generate request and print the unwrapped reply
    Send {
        /// Model to request (e.g., gemini-2.5-flash, claude-sonnet-4-5-thinking-low)
        #[arg(short, long)]
        model: String,

        /// Use streamGenerateContent and print events as they arrive
        #[arg(long)]
        stream: bool,

        /// JSON file holding the request body ("-" reads stdin)
        file: PathBuf,
    },

    /// Show stored token status without printing the token
    Token,
}
