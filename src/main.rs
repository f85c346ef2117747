//! Process entry point: configuration, tracing, then the server loop.

use kassa_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let _log_guard = kassa_server::init_tracing(&config);

    kassa_server::run(config).await
}
