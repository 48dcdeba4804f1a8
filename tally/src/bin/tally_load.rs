//! Load harness for the increment queue
//!
//! Drives many reporter threads into one [`IncrementQueue`] backed by an
//! in-memory store and checks at the end that every reported amount was
//! either written or refused by the store.

use std::{
    fs, io,
    num::NonZeroU32,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tally::{
    IncrementQueue, MetricTarget,
    config::{self, Config},
    drain::{self, FailurePolicy},
    scheduler::TokioScheduler,
    store::MemoryStore,
};
use tokio::runtime::Builder;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, util::SubscriberInitExt};
use uuid::Uuid;

const FLUSH_RETRY: Duration = Duration::from_millis(10);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Reporter thread panicked")]
    ReporterPanicked,
    #[error("Reported {reported} but only accounted for {accounted}")]
    Mismatch { reported: f64, accounted: f64 },
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// path on disk to the configuration file, defaults apply if absent
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// number of reporter threads, overrides the configuration file
    #[clap(long)]
    reporters: Option<NonZeroU32>,
    /// seconds to run reporters for, overrides the configuration file
    #[clap(long)]
    duration_secs: Option<f64>,
}

/// The key space and amounts a reporter draws from.
#[derive(Debug, Clone, Copy)]
struct Shape {
    entities: u32,
    dimensions: u32,
    targets: u32,
    event_buckets: u32,
    max_amount: i32,
    delay: Duration,
}

impl Shape {
    fn new(config: &Config) -> Result<Self, config::Error> {
        Ok(Self {
            entities: config.entities.get(),
            dimensions: config.dimensions.get(),
            targets: config.targets.get(),
            event_buckets: config.event_buckets,
            max_amount: i32::try_from(config.max_amount).unwrap_or(i32::MAX),
            delay: config.delay()?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Reported {
    reports: u64,
    amount: f64,
}

fn reporter(
    queue: &IncrementQueue,
    shape: Shape,
    deadline: Instant,
    stop: &AtomicBool,
    seed: u64,
) -> Reported {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut reported = Reported::default();

    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        let entity = Uuid::from_u128(u128::from(rng.random_range(0..shape.entities)));
        let dimension = Uuid::from_u128(u128::from(rng.random_range(0..shape.dimensions)));
        let target = MetricTarget::new(Uuid::nil(), rng.random_range(0..shape.targets));
        let event_ms = (shape.event_buckets > 0)
            .then(|| i64::from(rng.random_range(0..shape.event_buckets)) * 60_000);
        // Whole numbers keep every sum exact, which the final check relies on.
        let amount = f64::from(rng.random_range(-shape.max_amount..=shape.max_amount));

        queue.report_increment(entity, dimension, event_ms, target, amount, shape.delay);
        reported.reports += 1;
        reported.amount += amount;
    }
    reported
}

/// Drain whatever is left once reporters have stopped.
fn final_flush(queue: &IncrementQueue) {
    loop {
        match queue.flush() {
            Ok(summary) => {
                debug!(written = summary.written, "final flush");
                if queue.map().is_empty() {
                    return;
                }
            }
            Err(drain::Error::Busy) => thread::sleep(FLUSH_RETRY),
            Err(err) => warn!("final flush failed, retrying: {err}"),
        }
    }
}

fn run(args: Args) -> Result<(), Error> {
    let mut config = match args.config_path {
        Some(path) => Config::from_yaml(&fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    if let Some(reporters) = args.reporters {
        config.reporters = reporters;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.duration_secs = duration_secs;
    }
    let duration = config.duration()?;
    let shape = Shape::new(&config)?;
    info!(?config, "starting load");

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    if let Some(addr) = config.prometheus_addr {
        let _guard = runtime.enter();
        PrometheusBuilder::new().with_http_listener(addr).install()?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, stopping reporters");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let store = Arc::new(MemoryStore::new("memory"));
    store.fail_every(config.fail_every);
    let scheduler = Arc::new(TokioScheduler::new(runtime.handle().clone()));
    let queue = IncrementQueue::with_policy(
        Arc::clone(&store) as _,
        scheduler,
        config.failure_policy,
    );

    let started = Instant::now();
    let deadline = started + duration;
    let reported = thread::scope(|s| -> Result<Reported, Error> {
        let mut handles = Vec::with_capacity(config.reporters.get() as usize);
        for id in 0..config.reporters.get() {
            let queue = &queue;
            let stop = &stop;
            let handle = thread::Builder::new()
                .name(format!("reporter-{id}"))
                .spawn_scoped(s, move || {
                    reporter(queue, shape, deadline, stop, u64::from(id))
                })?;
            handles.push(handle);
        }

        let mut total = Reported::default();
        for handle in handles {
            let t = handle.join().map_err(|_| Error::ReporterPanicked)?;
            total.reports += t.reports;
            total.amount += t.amount;
        }
        Ok(total)
    })?;
    let elapsed = started.elapsed();

    final_flush(&queue);
    runtime.shutdown_timeout(Duration::from_secs(1));

    let written = store.written_amount();
    let rejected = store.rejected_amount();
    let accounted = written + rejected;
    info!(
        reports = reported.reports,
        writes = store.writes(),
        failures = store.failures(),
        counters = store.counters(),
        reported = reported.amount,
        written,
        rejected,
        elapsed_ms = elapsed.as_millis(),
        "load complete"
    );

    // Discarded amounts never reach the store, so only a run that retains
    // pending increments, or never fails, can be reconciled exactly.
    if config.fail_every > 0 && config.failure_policy == FailurePolicy::DiscardPending {
        warn!("pending increments were discarded on failure, skipping reconciliation");
        return Ok(());
    }
    if (reported.amount - accounted).abs() > f64::EPSILON {
        return Err(Error::Mismatch {
            reported: reported.amount,
            accounted,
        });
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let res = run(Args::parse());
    if let Err(err) = &res {
        error!("tally-load failed: {err}");
    }
    res
}
