use inscriber_worker::app;
use inscriber_worker::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    inscriber_observability::init();

    let config = WorkerConfig::from_env()?;
    app::run(config).await
}
