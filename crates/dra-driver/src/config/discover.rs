use std::path::PathBuf;

use clap::Parser;

use crate::config::daemon::DEFAULT_DRIVER_NAME;

#[derive(Parser, Clone, Debug)]
pub struct DiscoverArgs {
    #[arg(
        long,
        env = "DRIVER_NAME",
        default_value = DEFAULT_DRIVER_NAME,
        help = "Name of the DRA driver"
    )]
    pub driver_name: String,

    #[arg(
        long,
        env = "NODE_NAME",
        default_value = "localhost",
        help = "Node name used for the ResourceSlice"
    )]
    pub node_name: String,

    #[arg(
        long,
        default_value = "/",
        value_hint = clap::ValueHint::DirPath,
        help = "Root under which /sys and /dev are read"
    )]
    pub host_root: PathBuf,
}
