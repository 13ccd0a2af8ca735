use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{error, info, warn, Dispatch};
use tracing_subscriber::fmt::time::ChronoLocal;

use kt_invert::config::{Cli, TrainConfig};
use kt_invert::data::{Cifar10Dataset, ImageDataset};
use kt_invert::tasks::{parse_resume_tag, Networks, RunLayout, Trainer};

const LOG_TIME_FORMAT: &str = "[%Y/%m/%d-%H:%M]";

fn main() -> Result<()> {
    let cfg = Cli::parse().into_config();
    let layout = RunLayout::create(&cfg.experiments_dir, &cfg.project_name, cfg.resume)?;

    let dispatch = log_dispatch(&cfg, &layout)?;
    let _guard = tracing::dispatcher::set_default(&dispatch);
    run_logged(cfg, layout)
}

/// [`run`], with any failure also written to the run log.
fn run_logged(cfg: TrainConfig, layout: RunLayout) -> Result<()> {
    if let Err(e) = run(cfg, layout) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

/// Stdout in debug mode, otherwise the run's log file.
fn log_dispatch(cfg: &TrainConfig, layout: &RunLayout) -> Result<Dispatch> {
    let builder = tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_target(false);
    if cfg.debug {
        return Ok(Dispatch::new(builder.with_writer(std::io::stdout).finish()));
    }
    let path = layout.log_path();
    let file = OpenOptions::new()
        .create(true)
        .append(cfg.resume)
        .write(true)
        .truncate(!cfg.resume)
        .open(&path)
        .with_context(|| format!("open log file {:?}", path))?;
    Ok(Dispatch::new(
        builder.with_ansi(false).with_writer(Mutex::new(file)).finish(),
    ))
}

fn run(mut cfg: TrainConfig, layout: RunLayout) -> Result<()> {
    cfg.validate()?;
    cfg.resolve_paths()?;
    let device = match Device::new_cuda(0) {
        Ok(d) => {
            info!("using device: CUDA(0)");
            d
        }
        Err(e) => {
            info!("CUDA not available: {e}");
            Device::Cpu
        }
    };
    info!("{}", serde_json::to_string(&cfg)?);
    info!("project dir: {:?}, run tag: {}", layout.project_dir, layout.run_tag);

    let (train, eval) = match &cfg.data_dir {
        Some(dir) => {
            let (train, eval) = Cifar10Dataset::load(dir, cfg.gray)?;
            info!("CIFAR-10: {} train / {} test images", train.len(), eval.len());
            (Some(train), Some(eval))
        }
        None => {
            warn!("no --data-dir: pseudo codes only, test accuracy is skipped");
            (None, None)
        }
    };

    let start_epoch = match (&cfg.e2, cfg.resume) {
        (Some(e2), true) => {
            let (epoch, step) = parse_resume_tag(e2);
            info!("resuming from E{}S{} of {:?}", epoch, step, e2);
            epoch
        }
        _ => 0,
    };

    let nets = Networks::build(&cfg, &device)?;
    let mut trainer = Trainer::new(cfg, nets, layout, &device)?;
    trainer.run(
        train.as_ref().map(|d| d as &dyn ImageDataset),
        eval.as_ref().map(|d| d as &dyn ImageDataset),
        start_epoch,
    )
}
