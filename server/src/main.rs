use clap::Parser;
use log::info;
use server::config::Config;
use server::network::Server;

/// Main-method of the application.
/// Parses command-line arguments, builds the worker pool and runs the server until Ctrl+C.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let table = server::default_table(&config)?;
        let server = Server::bind(&config, table).await?;
        info!(
            "accepting up to {} connections on {} worker(s)",
            config.max_connections, config.workers
        );
        server.run().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
