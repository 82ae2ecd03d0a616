//! C3 offline smoke harness
//!
//! Runs a real worker against a live origin: install, activate, then fetch
//! every precached path twice (network then cache) and print a JSON summary
//! of timings and outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use c3_common::{init_logging, LogConfig, LogFormat};
use c3_net::{LoaderConfig, Request, ResourceLoader};
use c3_sw::{FetchOutcome, OfflineCacheManager, ServiceWorkerEvent, WorkerConfig};
use serde_json::json;
use tracing::{info, warn};
use url::Url;

/// Performance timing collector for tracking operation durations.
#[derive(Default)]
struct PerfTiming {
    timings: HashMap<&'static str, Vec<Duration>>,
}

impl PerfTiming {
    fn record(&mut self, operation: &'static str, duration: Duration) {
        self.timings.entry(operation).or_default().push(duration);
    }

    fn summary(&self) -> serde_json::Value {
        let mut summary = serde_json::Map::new();

        for (op, durations) in &self.timings {
            if durations.is_empty() {
                continue;
            }

            let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
            let count = ms.len();
            let total_ms: f64 = ms.iter().sum();
            let min_ms = ms.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            summary.insert(
                op.to_string(),
                json!({
                    "count": count,
                    "total_ms": round2(total_ms),
                    "avg_ms": round2(total_ms / count as f64),
                    "min_ms": round2(min_ms),
                    "max_ms": round2(max_ms),
                }),
            );
        }

        serde_json::Value::Object(summary)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Parse command line arguments
struct Args {
    config: Option<String>,
    origin: Option<String>,
    cache_version: Option<String>,
    log_format: Option<LogFormat>,
    timeout_ms: Option<u64>,
    perf_output: Option<String>,
}

impl Args {
    fn parse() -> anyhow::Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            origin: None,
            cache_version: None,
            log_format: None,
            timeout_ms: None,
            perf_output: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next(),
                "--origin" => parsed.origin = args.next(),
                "--cache-version" => parsed.cache_version = args.next(),
                "--log-format" => {
                    if let Some(val) = args.next() {
                        parsed.log_format = Some(val.parse()?);
                    }
                }
                "--timeout-ms" => {
                    if let Some(val) = args.next() {
                        parsed.timeout_ms =
                            Some(val.parse().context("--timeout-ms takes milliseconds")?);
                    }
                }
                "--perf-output" => parsed.perf_output = args.next(),
                other => bail!("unknown argument: {other}"),
            }
        }

        Ok(parsed)
    }

    fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::from_json_file(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            config.origin = Url::parse(origin).with_context(|| format!("bad origin {origin}"))?;
        }
        if let Some(version) = &self.cache_version {
            config.cache_version = version.clone();
        }
        if self.timeout_ms.is_some() {
            config.network_timeout_ms = self.timeout_ms;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse()?;
    let mut log_config = LogConfig::from_env()?;
    if let Some(format) = args.log_format {
        log_config = log_config.with_format(format);
    }
    init_logging(log_config)?;

    let config = args.worker_config()?;
    info!(
        origin = %config.origin,
        version = %config.cache_version,
        assets = config.precache.len(),
        "Starting C3 offline smoke run"
    );

    let loader = ResourceLoader::new(LoaderConfig::default())?;
    let precache = config.precache.clone();
    let origin = config.origin.clone();
    let (manager, mut events) = OfflineCacheManager::new(config, Arc::new(loader))?;
    let worker = manager.start();

    let mut perf = PerfTiming::default();
    let started = Instant::now();

    let t = Instant::now();
    let installed = worker.install().await;
    perf.record("install", t.elapsed());
    let installed = installed.context("install failed")?;

    let t = Instant::now();
    let activated = worker.activate().await.context("activate failed")?;
    perf.record("activate", t.elapsed());

    let mut hits = 0usize;
    let mut misses = 0usize;
    for path in &precache {
        let url = origin.join(path)?;
        for _ in 0..2 {
            let t = Instant::now();
            let outcome = worker.fetch(Request::get(url.clone())).await?;
            match outcome {
                FetchOutcome::Respond(response) if response.from_cache => {
                    perf.record("fetch_cached", t.elapsed());
                    hits += 1;
                }
                FetchOutcome::Respond(response) => {
                    perf.record("fetch_network", t.elapsed());
                    misses += 1;
                    if !response.ok() {
                        warn!(%url, status = %response.status, "Fetch not ok");
                    }
                }
                FetchOutcome::Passthrough => warn!(%url, "Unexpected passthrough"),
            }
        }
    }

    worker.wait_idle().await;
    worker.shutdown().await?;

    let mut state_changes = 0usize;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ServiceWorkerEvent::StateChange { .. }) {
            state_changes += 1;
        }
    }

    let report = json!({
        "origin": origin.as_str(),
        "generation": installed.generation,
        "cached": installed.cached,
        "offline_cached": installed.offline_cached,
        "deleted_generations": activated.deleted,
        "cache_hits": hits,
        "network_fetches": misses,
        "state_changes": state_changes,
        "elapsed_ms": round2(started.elapsed().as_secs_f64() * 1000.0),
        "timings": perf.summary(),
    });
    let rendered = serde_json::to_string_pretty(&report)?;

    match &args.perf_output {
        Some(path) => {
            std::fs::write(path, &rendered).with_context(|| format!("writing {path}"))?;
            info!(path = %path, "Wrote smoke report");
        }
        None => println!("{rendered}"),
    }

    Ok(())
}
