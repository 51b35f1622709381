//! CLI Command Definitions
//!
//! Defines the command-line interface using clap.

pub mod run;

use clap::{Parser, Subcommand};
use rt_core::brand::{BIN_NAME, DESCRIPTION};
use std::path::PathBuf;

/// RTunnel - TCP over WebRTC data channels
///
/// Exposes local TCP services to a remote peer through WebRTC. A Socket.IO
/// relay is only used to pair the peers and exchange connection details.
#[derive(Parser, Debug)]
#[command(name = BIN_NAME)]
#[command(author, version, about = DESCRIPTION)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (defaults to config.dev.json / config.json next to
    /// the binary, then the user config directory)
    #[arg(short, long, global = true, value_name = "FILE", env = "RTUNNEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expose the configured mappings
    ///
    /// Offers a session to the peer on every connection to the signaling
    /// server and listens locally for each mapping once it is usable.
    #[command(visible_alias = "l")]
    Listen,

    /// Dial mapped addresses for a listening peer
    ///
    /// Answers offers from the listening peer and connects to the remote
    /// address named by each tunneled stream.
    #[command(visible_alias = "s")]
    Send,
}
