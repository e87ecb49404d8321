#[cfg(feature = "cli")]
mod cli {
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use clap::Parser;
    use memory_worker::{config::Config, run_server, spawn_lock::SpawnMutex};
    use tracing::{info, warn};

    #[derive(Debug, Parser)]
    #[command(name = "memory-worker", version, about = "Local memory worker service")]
    pub struct Args {
        /// Port to listen on (overrides API_PORT)
        #[arg(long, short)]
        pub port: Option<u16>,

        /// Data directory (overrides MEMORY_WORKER_DATA_DIR)
        #[arg(long)]
        pub data_dir: Option<PathBuf>,
    }

    pub async fn run() -> anyhow::Result<()> {
        let args = Args::parse();
        memory_worker::telemetry::init_tracing();
        memory_worker::metrics::init_metrics();

        let mut cfg = Config::from_env()?;
        if let Some(port) = args.port {
            cfg.api_port = port;
        }
        if let Some(dir) = args.data_dir {
            cfg.db_path = dir.join("memory.db");
            cfg.data_dir = dir;
        }

        let mutex = SpawnMutex::new(cfg.data_dir.clone(), cfg.spawn_lock_stale());
        let key = cfg.spawn_lock_key();
        let base_url = cfg.base_url();
        let ready_timeout = Duration::from_secs(cfg.readiness_timeout_seconds);

        match mutex.with_lock(&key, || run_server(cfg)).await? {
            Some(result) => result,
            None => {
                info!("Another instance is starting on port {}, waiting for it", key);
                wait_until_ready(&base_url, ready_timeout).await
            }
        }
    }

    async fn wait_until_ready(base_url: &str, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        let url = format!("{}/api/readiness", base_url);
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!("Worker at {} is ready", base_url);
                    return Ok(());
                }
                Ok(resp) => warn!("Readiness returned {}", resp.status()),
                Err(e) => tracing::debug!("Readiness probe failed: {}", e),
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        anyhow::bail!("Worker at {} did not become ready within {:?}", base_url, timeout)
    }
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::run().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
