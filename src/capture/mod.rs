pub mod journal;
pub mod proxy;

use crate::config::CaptureConfig;
use crate::violation::Collector;
use journal::ReportLog;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Upper bound for the initial upstream reachability check
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Capture violation reports until the scan ends, then hand back the collector.
///
/// Reports flow from the proxy handlers through a queue to a single consumer
/// that owns the collector, so ingestion never interleaves. Setup failures are
/// logged and end the capture early; whatever was collected is still returned.
pub async fn run_scan(capture: &CaptureConfig, save_reports: Option<&str>) -> Collector {
    let collector = Collector::with_exclusions(&capture.exclude_sources);
    let log = match save_reports {
        Some(path) => match ReportLog::create(path).await {
            Ok(log) => {
                info!("Saving raw reports to {}", path);
                Some(log)
            }
            Err(e) => {
                error!("{:#}", e);
                None
            }
        },
        None => None,
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let ((), collector) = tokio::join!(
        capture_until_done(capture, tx),
        consume(rx, collector, log)
    );

    info!(
        "Capture finished: {} reports at {} distinct locations",
        collector.total_occurrences(),
        collector.len()
    );
    collector
}

async fn capture_until_done(capture: &CaptureConfig, reports: UnboundedSender<String>) {
    // Armed before the probe so the deadline and signals also cover setup
    let timeout = capture.timeout_secs.map(Duration::from_secs);
    let mut scan_end = Box::pin(end_of_scan(timeout));

    tokio::select! {
        probe = probe_upstream(&capture.upstream) => {
            if let Err(e) = probe {
                error!("Upstream {} is unreachable: {}", capture.upstream, e);
                warn!("Skipping capture, reporting what was collected");
                return;
            }
        }
        _ = &mut scan_end => {
            warn!("Scan ended before upstream {} answered", capture.upstream);
            return;
        }
    }

    if let Err(e) = proxy::serve(capture, reports, scan_end).await {
        error!("Capture proxy failed: {:#}", e);
    }
}

async fn probe_upstream(upstream: &str) -> reqwest::Result<()> {
    let client = reqwest::Client::builder()
        .no_proxy()
        .connect_timeout(PROBE_TIMEOUT)
        .timeout(PROBE_TIMEOUT)
        .build()?;
    let response = client.get(upstream).send().await?;
    debug!("Upstream answered {}", response.status());
    Ok(())
}

/// Drain the report queue into the collector until every sender is gone
async fn consume(
    mut rx: UnboundedReceiver<String>,
    mut collector: Collector,
    mut log: Option<ReportLog>,
) -> Collector {
    while let Some(payload) = rx.recv().await {
        if let Some(log) = log.as_mut() {
            if let Err(e) = log.append(&payload).await {
                error!("Failed to save report: {:#}", e);
            }
        }
        collector.ingest(&payload);
        debug!(
            "Collected {} reports at {} locations",
            collector.total_occurrences(),
            collector.len()
        );
    }
    collector
}

/// Resolves when the scan timeout elapses or the operator interrupts
async fn end_of_scan(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => info!(
            "Scanning for {}s, press Ctrl+C to stop early",
            duration.as_secs()
        ),
        None => info!("Scanning until interrupted (Ctrl+C)"),
    }
    let elapsed = async {
        match timeout {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = elapsed => info!("Scan timeout elapsed"),
        _ = interrupted() => {}
    }
}

async fn interrupted() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => warn!("Received SIGINT, ending scan..."),
                    _ = sigterm.recv() => warn!("Received SIGTERM, ending scan..."),
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, falling back to Ctrl+C"),
        }
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Received Ctrl+C, ending scan...");
    } else {
        std::future::pending::<()>().await;
    }
}
