#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use gatehouse::{admin, config, lifecycle, logging, metrics, runtime};
use std::path::PathBuf;

/// Multi-listener HTTP forward proxy.
#[derive(Parser, Debug)]
#[command(name = "gatehouse", about = "Multi-listener HTTP forward proxy")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Address for the admin/health/metrics side listener.
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

fn main() -> anyhow::Result<()> {
    lifecycle::set_umask();

    let cli = Cli::parse();

    let worker_threads = runtime::get_container_cpu_limit();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    logging::init();

    let cfg = config::Config::load(&cli.config)?;
    let manager = lifecycle::ProxyManager::new(&cfg)?;

    manager.run(&cfg).await?;

    let metrics = metrics::Metrics::install();
    let admin_listen = cli.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = admin::run(&admin_listen, metrics).await {
            tracing::error!("admin: failed, error={}", e);
        }
    });

    tracing::info!("gatehouse: started, listeners={}", cfg.listeners.len());

    lifecycle::wait_for_shutdown_signal().await;

    manager.shutdown().await;
    tracing::info!("gatehouse: shutdown complete");
    Ok(())
}
