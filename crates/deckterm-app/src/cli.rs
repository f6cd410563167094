use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use deckterm_remote::{GatewayConfig, DEFAULT_PORT};

/// A terminal you can drive from a Stream Deck.
#[derive(Debug, Parser)]
#[command(name = "deckterm", version, about)]
pub struct Cli {
    /// Shell to start. Defaults to the last one used, then $SHELL.
    #[arg(long, value_name = "PATH")]
    pub shell: Option<String>,

    /// Address the remote command listener binds to.
    #[arg(long, value_name = "IP", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Do not accept remote clients.
    #[arg(long)]
    pub no_remote: bool,

    /// Send shell output to remote clients as well as keystrokes.
    #[arg(long)]
    pub mirror_output: bool,

    /// Directory the shell starts in. Defaults to the home directory.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Where preferences and logs are kept. Defaults to ~/.deckterm.
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Print the shells that can be switched to and exit.
    #[arg(long)]
    pub list_shells: bool,
}

impl Cli {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            bind: SocketAddr::new(self.bind, self.port),
            mirror_output: self.mirror_output,
        }
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| deckterm_pty::pty::home_dir().map(|home| home.join(".deckterm")))
    }
}
