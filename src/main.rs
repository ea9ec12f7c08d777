use std::process::Command;
use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use rte::config::CliArgs;
use rte::monitoring;
use rte::scheduler::{self, Scheduler};
use rte::selftest;
use rte::web_server::{build_metrics_server, build_server};

/// Check if a command exists in the system PATH
fn check_command_exists(command: &str) -> bool {
    Command::new("which")
        .arg(command)
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = CliArgs::parse();
    let log_level = if cli.debug { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(log_level));

    if !check_command_exists("docker") {
        log::error!("Required command 'docker' not found. Please install Docker.");
        std::process::exit(1);
    }

    let ctx = cli.to_context().unwrap_or_else(|e| {
        log::error!("Failed to resolve configuration: {e}");
        std::process::exit(1);
    });
    if cli.debug {
        log::debug!("Using API key: {}", ctx.api_key);
    }
    log::info!("Using test data directory {}", ctx.testdata_dir.display());

    if let Err(e) = std::fs::create_dir_all(&ctx.testrun_dir) {
        log::error!(
            "Failed to create test run directory {}: {e}",
            ctx.testrun_dir.display()
        );
        std::process::exit(1);
    }

    if cli.test_solution {
        if let Err(e) = selftest::run(&ctx, &cli.host, cli.port, &cli.test_name).await {
            log::error!("Solution test failed: {e}");
            std::process::exit(1);
        }
        return Ok(());
    }

    monitoring::init_monitoring();

    let ctx = Arc::new(ctx);
    let scheduler = Arc::new(Scheduler::new());
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    log::info!("Remote test executor starting up...");

    let mut workers = JoinSet::new();
    scheduler::spawn_workers(
        &mut workers,
        ctx.clone(),
        scheduler.clone(),
        shutdown_token.clone(),
    );

    let server = build_server(
        &cli.host,
        cli.port,
        &cli.context_path,
        ctx.clone(),
        scheduler.clone(),
    )
    .unwrap_or_else(|e| {
        log::error!("Failed to start web server: {e}");
        std::process::exit(1);
    });
    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    log::info!("Exposing metrics on '{}'", cli.metrics_address);
    let metrics_server = build_metrics_server(&cli.metrics_address).unwrap_or_else(|e| {
        log::error!("Failed to bind metrics address: {e}");
        std::process::exit(1);
    });
    let metrics_handle = metrics_server.handle();
    let metrics_task = actix_web::rt::spawn(metrics_server);

    log::info!("Listening on '{}:{}'", cli.host, cli.port);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {res_server:?}");
        }
        res_metrics = metrics_task => {
            log::error!("Metrics server terminated unexpectedly: {res_metrics:?}");
        }
        Some(res_worker) = workers.join_next() => {
            log::error!("A worker terminated unexpectedly: {res_worker:?}");
        }
    }

    // 1. Shutdown the HTTP servers gracefully
    server_handle.stop(true).await;
    metrics_handle.stop(true).await;

    // 2. Broadcast shutdown signal to stage workers
    shutdown_token.cancel();
    log::info!("Shutdown signal sent to workers, waiting for them to finish...");

    // 3. Wait until every worker terminates
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                log::error!("Worker handle panicked: {e:?}");
            } else {
                log::error!("Worker handle finished with error: {e:?}");
            }
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
