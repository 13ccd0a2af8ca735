//! Command-line surface of the trainer.
//!
//! ```bash
//! kt-invert --num-dec 3 --data-dir ./CIFAR10_data --e1 'models/*best*.safetensors'
//! kt-invert --num-dec 1 --steps-per-epoch 200 --e1 none --debug
//! kt-invert --resume --e2 'weights/*_se_E12S340*' --project-name run7
//! ```

use clap::Parser;
use std::path::PathBuf;

use super::config::{LossWeights, TrainConfig};

/// Knowledge transfer by logit inversion
#[derive(Parser, Debug, Clone)]
#[command(name = "kt-invert")]
#[command(version)]
#[command(about = "Train decoders to invert a fixed classifier and distil small encoders on their images")]
pub struct Cli {
    /// Teacher (big encoder) weights; wildcards allowed. `none` uses a random teacher
    #[arg(long, default_value = "models/model_best.safetensors")]
    pub e1: String,

    /// Small-encoder weights; wildcards allowed
    #[arg(long)]
    pub e2: Option<PathBuf>,

    /// Directory of pretrained decoder weights
    #[arg(long)]
    pub pretrained_dir: Option<PathBuf>,

    /// Run tag of the pretrained decoders
    #[arg(long)]
    pub pretrained_timeid: Option<String>,

    /// CIFAR-10 binary directory (data_batch_*.bin, test_batch.bin)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 9)]
    pub num_dec: usize,

    #[arg(long, default_value_t = 1)]
    pub num_se: usize,

    #[arg(long, default_value_t = 10)]
    pub num_class: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    /// Adam: decay of first-order momentum
    #[arg(long, default_value_t = 5e-4)]
    pub b1: f64,

    /// Adam: decay of second-order momentum
    #[arg(long, default_value_t = 5e-4)]
    pub b2: f64,

    /// Perceptual loss weight
    #[arg(long, default_value_t = 1.0)]
    pub lw_perc: f64,

    #[arg(long, default_value_t = 10.0)]
    pub lw_soft: f64,

    #[arg(long, default_value_t = 1.0)]
    pub lw_hard: f64,

    #[arg(long, default_value_t = 1e-6)]
    pub lw_tv: f64,

    #[arg(long, default_value_t = 1e-4)]
    pub lw_norm: f64,

    /// Defined-transform consistency weight
    #[arg(long = "lw-da", default_value_t = 10.0)]
    pub lw_da: f64,

    #[arg(long, default_value_t = 0.5)]
    pub lw_adv: f64,

    #[arg(long, default_value_t = 10.0)]
    pub lw_class: f64,

    #[arg(short, long, default_value_t = 256)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 100)]
    pub test_batch_size: usize,

    #[arg(short, long, default_value = "test")]
    pub project_name: String,

    #[arg(long, default_value = "../Experiments")]
    pub experiments_dir: PathBuf,

    /// Keep the existing project directory and continue from the epoch tagged in --e2
    #[arg(short, long)]
    pub resume: bool,

    #[arg(long, default_value_t = 96)]
    pub num_epoch: usize,

    /// Steps per epoch when there is no training set to size the epoch
    #[arg(long)]
    pub steps_per_epoch: Option<usize>,

    /// Log to stdout instead of the run's log file
    #[arg(long)]
    pub debug: bool,

    /// Drive the decoders with teacher logits of real images instead of sampled codes
    #[arg(long)]
    pub no_pseudo_code: bool,

    #[arg(long, default_value_t = 25.0)]
    pub begin: f64,

    #[arg(long, default_value_t = 20.0)]
    pub end: f64,

    /// Temperature
    #[arg(long, default_value_t = 1.0)]
    pub temp: f64,

    /// Backpropagate the soft-target term as well
    #[arg(long)]
    pub soft_target: bool,

    /// Exponential moving average decay
    #[arg(long, default_value_t = 0.9)]
    pub ema_factor: f64,

    #[arg(long)]
    pub no_ema: bool,

    /// Interval to print logs
    #[arg(long, default_value_t = 10)]
    pub show_interval: usize,

    /// Interval to save sample images
    #[arg(long, default_value_t = 100)]
    pub save_interval: usize,

    /// Interval to test and save models
    #[arg(long, default_value_t = 1000)]
    pub test_interval: usize,

    #[arg(long)]
    pub gray: bool,

    /// Add the hard-label loss of the decoder-averaged image
    #[arg(long)]
    pub use_ave_img: bool,

    #[arg(long)]
    pub seed: Option<u64>,
}

impl Cli {
    pub fn into_config(self) -> TrainConfig {
        let defaults = TrainConfig::default();
        let e1 = if self.e1.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(PathBuf::from(self.e1))
        };
        TrainConfig {
            num_dec: self.num_dec,
            num_se: self.num_se,
            num_class: self.num_class,
            batch_size: self.batch_size,
            test_batch_size: self.test_batch_size,
            num_epoch: self.num_epoch,
            steps_per_epoch: self.steps_per_epoch,
            lr: self.lr,
            b1: self.b1,
            b2: self.b2,
            loss: LossWeights {
                perc: self.lw_perc,
                soft: self.lw_soft,
                hard: self.lw_hard,
                tv: self.lw_tv,
                norm: self.lw_norm,
                da: self.lw_da,
                adv: self.lw_adv,
                class: self.lw_class,
            },
            use_ema: !self.no_ema,
            ema_factor: self.ema_factor,
            use_pseudo_code: !self.no_pseudo_code,
            begin: self.begin,
            end: self.end,
            temp: self.temp,
            soft_target: self.soft_target,
            use_ave_img: self.use_ave_img,
            gray: self.gray,
            show_interval: self.show_interval,
            save_interval: self.save_interval,
            test_interval: self.test_interval,
            resume: self.resume,
            debug: self.debug,
            seed: self.seed,
            project_name: self.project_name,
            experiments_dir: self.experiments_dir,
            data_dir: self.data_dir,
            e1,
            e2: self.e2,
            pretrained_dir: self.pretrained_dir,
            pretrained_timeid: self.pretrained_timeid,
            ..defaults
        }
    }
}
