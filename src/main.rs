use std::sync::Arc;
use std::sync::atomic::Ordering;

use feedback_worker::classifier::{Classifier, LexiconClassifier};
use feedback_worker::config::WorkerConfig;
use feedback_worker::error::Result;
use feedback_worker::store::{LibSqlBackend, WorkStore};
use feedback_worker::worker::{ProcessingLoop, SleepPacer, spawn_processing_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let classifier: Arc<dyn Classifier> = Arc::new(LexiconClassifier::new());

    eprintln!("Feedback worker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Classifier: {}", classifier.model());
    eprintln!(
        "   Batch: {} records, {} loop(s), lease {}s",
        config.batch_size,
        config.concurrency,
        config.claim_ttl.as_secs()
    );
    eprintln!(
        "   Cadence: drain {}ms, idle {}ms\n",
        config.drain_delay.as_millis(),
        config.idle_delay.as_millis()
    );

    // ── Startup recovery: free rows held by a previous crashed run ────────
    let admin = open_store(&config).await.unwrap_or_else(|e| {
        eprintln!("Error: failed to open database: {e}");
        std::process::exit(1);
    });
    match admin.release_expired_claims().await {
        Ok(0) => {}
        Ok(n) => eprintln!("   Released {n} expired claims"),
        Err(e) => tracing::warn!(error = %e, "Failed to release expired claims"),
    }
    match admin.count_pending().await {
        Ok(n) => tracing::info!(pending = n, "Backlog at startup"),
        Err(e) => tracing::warn!(error = %e, "Failed to count pending records"),
    }
    drop(admin);

    // ── Processing loops, one connection each ─────────────────────────────
    let mut handles = Vec::with_capacity(config.concurrency);
    let mut shutdown_flags = Vec::with_capacity(config.concurrency);
    for i in 0..config.concurrency {
        let store: Arc<dyn WorkStore> = open_store(&config).await?;
        let processing_loop = ProcessingLoop::new(
            format!("worker-{i}"),
            store,
            Arc::clone(&classifier),
            &config,
        );
        let (handle, shutdown) = spawn_processing_loop(processing_loop, Arc::new(SleepPacer));
        handles.push(handle);
        shutdown_flags.push(shutdown);
    }

    wait_for_shutdown().await;
    tracing::info!("Shutdown requested, finishing in-flight batches");

    for flag in &shutdown_flags {
        flag.store(true, Ordering::Release);
    }
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Processing loop panicked");
        }
    }

    tracing::info!("Feedback worker stopped");
    Ok(())
}

async fn open_store(config: &WorkerConfig) -> Result<Arc<LibSqlBackend>> {
    Ok(Arc::new(LibSqlBackend::new_local(&config.db_path).await?))
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
