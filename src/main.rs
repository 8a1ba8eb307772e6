mod api;
mod config;
mod jobs;
mod scripts;
mod vm;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::Config;
use jobs::repo::JobRepo;
use jobs::worker::Worker;
use vm::executor::VmExecutor;
use vm::network::NetworkFabric;

#[tokio::main]
async fn main() {
    // 1. Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scriptvm=info,tower_http=info".parse().unwrap()),
        )
        .init();

    // 2. Parse config
    let config = Arc::new(Config::from_env());

    // 3. Ensure the data layout exists
    std::fs::create_dir_all(config.scripts_dir()).expect("failed to create scripts dir");
    std::fs::create_dir_all(config.logs_dir()).expect("failed to create logs dir");

    // 4. Open the job database
    let repo = JobRepo::connect(&config.db_path())
        .await
        .expect("failed to open job database");

    // 5. Broker channel between ingress and worker
    let (queue, task_rx) = jobs::queue::channel(config.queue_depth);

    // 6. VM engine: shared network fabric + executor
    let fabric = Arc::new(NetworkFabric::new(config.fallback_iface.clone()));
    let runner = Arc::new(VmExecutor::new(Arc::clone(&config), fabric));

    // 7. Start the queue worker
    let cancel = CancellationToken::new();
    let worker = Worker::new(
        repo.clone(),
        runner,
        task_rx,
        config.worker_concurrency,
    );
    let worker_handle = tokio::spawn(worker.run(cancel.clone()));

    // 8. Build API router and start serving
    let app = api::router(Arc::clone(&config), repo, queue);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .expect("failed to bind API listener");

    info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        network = config.enable_network,
        "scriptvm ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 9. Drain the worker before exit
    info!("shutting down");
    cancel.cancel();
    let _ = worker_handle.await;
    info!("all services stopped");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
