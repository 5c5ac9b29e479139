//! Benchmark harness: loads a model, builds a sequential forward plan and
//! times passes through the scheduler, optionally across threads.

mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::info;

use tinyinfer_engine::plan::LayerDependency;
use tinyinfer_engine::scheduler::{ExecMode, ForwardScheduler};
use tinyinfer_memory::config::PoolConfig;
use tinyinfer_memory::tensor::SimdPolicy;
use tinyinfer_memory::thread_safe::ThreadSafePool;
use tinyinfer_model::cache::{MappedModel, ModelCacheConfig};

use crate::report::{BenchReport, PassTiming};

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Normal,
    MemoryOpt,
    Streaming,
    Adaptive,
}

impl From<ModeArg> for ExecMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Normal => ExecMode::Normal,
            ModeArg::MemoryOpt => ExecMode::MemoryOpt,
            ModeArg::Streaming => ExecMode::Streaming,
            ModeArg::Adaptive => ExecMode::Adaptive,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormat {
    Json,
    Csv,
}

/// Benchmark harness for the tinyinfer memory substrate.
#[derive(Debug, Parser)]
#[command(name = "tinyinfer-bench", version, about)]
struct Cli {
    /// Model file to benchmark.
    #[arg(long)]
    model: PathBuf,

    /// Map the model file instead of positioned reads (0|1).
    #[arg(long, default_value_t = 1)]
    mmap: u8,

    /// Memory ceiling for the forward pass, in MiB (0 = uncapped).
    #[arg(long, default_value_t = 0)]
    memory: usize,

    /// Select SIMD-aligned allocation paths (0|1).
    #[arg(long, default_value_t = 1)]
    simd: u8,

    /// Worker threads, each running its own scheduler over the shared
    /// pool and model cache.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Execution mode for every pass.
    #[arg(long, value_enum, default_value_t = ModeArg::MemoryOpt)]
    mode: ModeArg,

    /// Forward passes per thread.
    #[arg(long, default_value_t = 3)]
    passes: usize,

    /// Report format.
    #[arg(long, value_enum, default_value_t = ReportFormat::Json)]
    report: ReportFormat,

    /// Write the report here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn run_passes(
    model: &Arc<MappedModel>,
    pool: &Arc<ThreadSafePool>,
    mode: ExecMode,
    max_memory: usize,
    simd: SimdPolicy,
    thread: usize,
    passes: usize,
) -> anyhow::Result<Vec<PassTiming>> {
    let mut scheduler =
        ForwardScheduler::new(Arc::clone(model), Arc::clone(pool), mode, max_memory);
    scheduler.set_simd(simd);
    for i in 0..model.layer_count() {
        let dependency = if i == 0 {
            LayerDependency::None
        } else {
            LayerDependency::Sequential
        };
        let output_bytes = model.descriptor(i)?.size as usize;
        scheduler.push_layer(i as u32, dependency, output_bytes)?;
    }

    let mut timings = Vec::with_capacity(passes);
    for pass in 0..passes {
        scheduler.prepare()?;
        let start = Instant::now();
        let executed = scheduler.run(None, None)?;
        let time_ms = start.elapsed().as_secs_f64() * 1000.0;
        anyhow::ensure!(
            executed == model.layer_count(),
            "pass {pass} executed {executed} of {} layers",
            model.layer_count()
        );
        timings.push(PassTiming {
            thread,
            pass,
            time_ms,
            peak_activation_bytes: scheduler.peak_memory_usage(),
        });
    }
    Ok(timings)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let max_memory = cli.memory * MIB;
    let simd = SimdPolicy::new(cli.simd != 0);
    let mode = ExecMode::from(cli.mode);
    let threads = cli.threads.max(1);

    let model = Arc::new(
        MappedModel::open(
            &cli.model,
            ModelCacheConfig {
                // The scheduler cap governs activations; the weight cache
                // runs unbounded so eviction pressure comes from real use.
                max_cache_bytes: 0,
                use_mmap: cli.mmap != 0,
                prefetch_enabled: true,
            },
        )
        .with_context(|| format!("opening model {}", cli.model.display()))?,
    );
    let pool = Arc::new(ThreadSafePool::new(PoolConfig::production())?);

    info!(
        model = %model.header().name,
        layers = model.layer_count(),
        ?mode,
        threads,
        "starting benchmark"
    );

    let mut timings = Vec::new();
    if threads == 1 {
        timings.extend(run_passes(
            &model, &pool, mode, max_memory, simd, 0, cli.passes,
        )?);
    } else {
        let handles: Vec<_> = (0..threads)
            .map(|thread| {
                let model = Arc::clone(&model);
                let pool = Arc::clone(&pool);
                let passes = cli.passes;
                std::thread::spawn(move || {
                    run_passes(&model, &pool, mode, max_memory, simd, thread, passes)
                })
            })
            .collect();
        for handle in handles {
            let thread_timings = handle
                .join()
                .map_err(|_| anyhow::anyhow!("benchmark thread panicked"))??;
            timings.extend(thread_timings);
        }
    }

    // Batch advice for a per-layer-sized sample, reported for operators
    // sizing their serving loop.
    let per_layer = model
        .descriptor(0)
        .map(|d| d.size as usize)
        .unwrap_or(MIB);
    let probe = ForwardScheduler::new(
        Arc::clone(&model),
        Arc::clone(&pool),
        mode,
        max_memory,
    );
    let optimal = probe.optimal_batch_size(per_layer, per_layer, 64);

    let report = BenchReport {
        model: model.header().name.clone(),
        layers: model.layer_count(),
        mode: format!("{mode:?}"),
        mmap: cli.mmap != 0,
        simd: simd.enabled(),
        threads,
        passes_per_thread: cli.passes,
        max_memory_bytes: max_memory,
        weight_cache_bytes: model.memory_usage(),
        peak_activation_bytes: timings
            .iter()
            .map(|t| t.peak_activation_bytes)
            .max()
            .unwrap_or(0),
        optimal_batch: optimal,
        avg_pass_ms: BenchReport::average_ms(&timings),
        pass_times: timings,
        pool: pool.stats(),
    };

    report.write(matches!(cli.report, ReportFormat::Csv), cli.output.as_deref())
}
