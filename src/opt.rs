use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mirage", version, about = "TCP tunnel hiding behind a real web site's TLS")]
pub struct Opt {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the local SOCKS5/HTTP proxy daemon
    Client {
        /// Path to the client JSON config
        config: PathBuf,
    },
    /// Run the fronted server daemon
    Server {
        /// Path to the server JSON config
        config: PathBuf,
    },
}
