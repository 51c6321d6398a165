use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::discover::DiscoverArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the DRA kubelet plugin
    Daemon(Box<DaemonArgs>),
    /// Print the devices this node would publish
    Discover(DiscoverArgs),
}
