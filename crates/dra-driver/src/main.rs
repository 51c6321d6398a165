use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use dra_driver::app::ApplicationBuilder;
use dra_driver::config::Cli;
use dra_driver::config::Commands;
use dra_driver::config::DaemonArgs;
use dra_driver::config::DiscoverArgs;
use dra_driver::discovery::resource_slice;
use dra_driver::discovery::Discovery;
use dra_driver::handler::rdma;
use dra_driver::platform::HostPaths;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Discover(discover_args) => run_discover(discover_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    tracing::info!(
        "Starting DRA driver {} on node {} ({})",
        daemon_args.driver_name,
        daemon_args.node_name,
        &**version::VERSION
    );

    let app = ApplicationBuilder::new(daemon_args).build().await?;
    app.run().await?;

    tracing::info!("Driver stopped");
    Ok(())
}

fn run_discover(args: DiscoverArgs) -> Result<()> {
    let mode = rdma::mode::netns_mode();
    let devices = Discovery::new(
        args.driver_name.clone(),
        HostPaths::with_root(&args.host_root),
        mode,
    )
    .discover();
    let slice = resource_slice(&args.driver_name, &args.node_name, &devices);
    let yaml = serde_yaml::to_string(&slice).context("serialize ResourceSlice")?;
    print!("{yaml}");
    Ok(())
}
