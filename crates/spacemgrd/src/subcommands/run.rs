//! The `run` subcommand.

use std::sync::Arc;

use anyhow::{Context, Result};
use spacemgr::{run_sweeper, Envelope, Refresher, Reply, SpaceManager};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cfg::DaemonConfig;
use crate::feed::FileCapacityFeed;

/// Run the sweeper and refresher until interrupted; with `serve_stdin`,
/// also answer newline-delimited JSON requests read from stdin.
pub(crate) fn run(
    config: &DaemonConfig,
    manager: Arc<SpaceManager>,
    serve_stdin: bool,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Unable to start the async runtime")?;
    runtime.block_on(run_daemon(config, manager, serve_stdin))
}

/// Main loop of the daemon.
async fn run_daemon(
    config: &DaemonConfig,
    manager: Arc<SpaceManager>,
    serve_stdin: bool,
) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let shutdown = move || {
        let mut rx = stop_rx.clone();
        async move {
            let _ = rx.wait_for(|stop| *stop).await;
        }
    };

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(run_sweeper(Arc::clone(&manager), shutdown())));
    match &config.capacity.file {
        Some(path) => {
            let feed = Arc::new(FileCapacityFeed::new(path));
            let refresher = Refresher::new(Arc::clone(&manager), feed);
            tasks.push(tokio::spawn(refresher.run(shutdown())));
        }
        None => warn!("No capacity file configured; link groups will not be refreshed."),
    }
    if serve_stdin {
        let manager = Arc::clone(&manager);
        let stop = shutdown();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                () = stop => {}
                r = serve(manager) => {
                    if let Err(e) = r {
                        warn!(error = %e, "request loop failed");
                    }
                }
            }
        }));
    }

    info!("spacemgrd {} running", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c()
        .await
        .context("Unable to listen for interrupts")?;
    info!("Interrupted; shutting down.");
    let _ = stop_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked");
        }
    }
    Ok(())
}

/// Answer one JSON [`Envelope`] per stdin line until EOF.
async fn serve(manager: Arc<SpaceManager>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => {
                let m = Arc::clone(&manager);
                tokio::task::spawn_blocking(move || m.handle(envelope)).await?
            }
            Err(e) => {
                debug!(error = %e, "unparseable request");
                Some(Reply::Failed {
                    kind: spacemgr::ErrorKind::InvalidArgument,
                    message: format!("malformed request: {}", e),
                })
            }
        };
        if let Some(reply) = reply {
            let mut out = serde_json::to_vec(&reply)?;
            out.push(b'\n');
            stdout.write_all(&out).await?;
            stdout.flush().await?;
        }
    }
    info!("request input closed");
    Ok(())
}
