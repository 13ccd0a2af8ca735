use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{KtError, Result};

/// Per-term loss weights of the composite objective.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LossWeights {
    pub perc: f64,
    pub soft: f64,
    pub hard: f64,
    pub tv: f64,
    pub norm: f64,
    #[serde(rename = "DA")]
    pub da: f64,
    pub adv: f64,
    pub class: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            perc: 1.0,
            soft: 10.0,
            hard: 1.0,
            tv: 1e-6,
            norm: 1e-4,
            da: 10.0,
            adv: 0.5,
            class: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub num_dec: usize,
    pub num_se: usize,
    pub num_class: usize,
    pub batch_size: usize,
    pub test_batch_size: usize,
    pub num_epoch: usize,
    pub steps_per_epoch: Option<usize>,
    pub lr: f64,
    pub b1: f64,
    pub b2: f64,
    pub loss: LossWeights,
    pub use_ema: bool,
    pub ema_factor: f64,
    pub use_pseudo_code: bool,
    pub begin: f64,
    pub end: f64,
    pub temp: f64,
    pub soft_target: bool,
    pub use_ave_img: bool,
    pub gray: bool,
    pub image_size: usize,
    pub image_channels: usize,
    pub norm_mean: Vec<f32>,
    pub norm_std: Vec<f32>,
    pub show_interval: usize,
    pub save_interval: usize,
    pub test_interval: usize,
    pub resume: bool,
    pub debug: bool,
    pub seed: Option<u64>,
    pub project_name: String,
    pub experiments_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    pub e1: Option<PathBuf>,
    pub e2: Option<PathBuf>,
    pub pretrained_dir: Option<PathBuf>,
    pub pretrained_timeid: Option<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_dec: 9,
            num_se: 1,
            num_class: 10,
            batch_size: 256,
            test_batch_size: 100,
            num_epoch: 96,
            steps_per_epoch: None,
            lr: 1e-3,
            b1: 5e-4,
            b2: 5e-4,
            loss: LossWeights::default(),
            use_ema: true,
            ema_factor: 0.9,
            use_pseudo_code: true,
            begin: 25.0,
            end: 20.0,
            temp: 1.0,
            soft_target: false,
            use_ave_img: false,
            gray: false,
            image_size: 32,
            image_channels: 3,
            norm_mean: vec![0.485, 0.456, 0.406],
            norm_std: vec![0.229, 0.224, 0.225],
            show_interval: 10,
            save_interval: 100,
            test_interval: 1000,
            resume: false,
            debug: false,
            seed: None,
            project_name: "test".to_string(),
            experiments_dir: PathBuf::from("../Experiments"),
            data_dir: None,
            e1: Some(PathBuf::from("models/model_best.safetensors")),
            e2: None,
            pretrained_dir: None,
            pretrained_timeid: None,
        }
    }
}

impl TrainConfig {
    /// Startup checks. Every failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.num_dec < 1 {
            return Err(KtError::Config("num_dec must be >= 1".into()));
        }
        if self.num_se < 1 {
            return Err(KtError::Config("num_se must be >= 1".into()));
        }
        if self.num_class < 2 {
            return Err(KtError::Config("num_class must be >= 2".into()));
        }
        if self.batch_size == 0 || self.test_batch_size == 0 {
            return Err(KtError::Config("batch sizes must be positive".into()));
        }
        if self.show_interval == 0 || self.save_interval == 0 || self.test_interval == 0 {
            return Err(KtError::Config("intervals must be positive".into()));
        }
        if self.use_pseudo_code && self.begin.floor() <= self.end.floor() {
            return Err(KtError::Config(format!(
                "pseudo-code boost range is empty: begin {} must exceed end {}",
                self.begin, self.end
            )));
        }
        if self.temp <= 0.0 {
            return Err(KtError::Config("temp must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.ema_factor) {
            return Err(KtError::Config(format!(
                "ema_factor {} outside [0, 1]",
                self.ema_factor
            )));
        }
        if self.image_size % 4 != 0 || self.image_size < 16 {
            return Err(KtError::Config(format!(
                "image_size {} must be a multiple of 4 and >= 16",
                self.image_size
            )));
        }
        if self.norm_mean.len() != self.image_channels || self.norm_std.len() != self.image_channels {
            return Err(KtError::Config(format!(
                "normalization needs {} channel values, got mean {} / std {}",
                self.image_channels,
                self.norm_mean.len(),
                self.norm_std.len()
            )));
        }
        if self.pretrained_dir.is_some() && self.pretrained_timeid.is_none() {
            return Err(KtError::Config(
                "pretrained_dir requires pretrained_timeid".into(),
            ));
        }
        Ok(())
    }

    /// Decoder input width. Codes live in logit space.
    pub fn code_dim(&self) -> usize {
        self.num_class
    }

    /// Resolve the weight-path options in place (see [`resolve_weight_path`]).
    pub fn resolve_paths(&mut self) -> Result<()> {
        if let Some(p) = self.e1.take() {
            self.e1 = Some(resolve_weight_path(&p)?);
        }
        if let Some(p) = self.e2.take() {
            self.e2 = Some(resolve_weight_path(&p)?);
        }
        if let Some(p) = self.pretrained_dir.take() {
            self.pretrained_dir = Some(resolve_weight_path(&p)?);
        }
        Ok(())
    }
}

/// Resolve a path that may carry `*` / `?` wildcards in its last component.
/// Exactly one match is required.
pub fn resolve_weight_path(pattern: &Path) -> Result<PathBuf> {
    if pattern.exists() {
        return Ok(pattern.to_path_buf());
    }
    let name = pattern
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| KtError::Config(format!("unresolvable path {:?}", pattern)))?;
    let dir = match pattern.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut matches = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(candidate) = entry.file_name().to_str() {
                if wildcard_match(name, candidate) {
                    matches.push(entry.path());
                }
            }
        }
    }
    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(KtError::Config(format!("no file matches {:?}", pattern))),
        n => Err(KtError::Config(format!(
            "{} files match {:?}, expected exactly one",
            n, pattern
        ))),
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_decoders() {
        let cfg = TrainConfig {
            num_dec: 0,
            ..TrainConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(KtError::Config(_))));
    }

    #[test]
    fn rejects_empty_boost_range() {
        let cfg = TrainConfig {
            begin: 20.0,
            end: 20.0,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("*_d3_*.safetensors", "SERVER1-20190313-1233_d3_E0S0.safetensors"));
        assert!(!wildcard_match("*_d3_*.safetensors", "SERVER1-20190313-1233_d4_E0S0.safetensors"));
        assert!(wildcard_match("model_?.bin", "model_a.bin"));
        assert!(!wildcard_match("model_?.bin", "model_ab.bin"));
    }

    #[test]
    fn resolve_requires_exactly_one_match() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("se_E1S2.safetensors"), b"x").unwrap();
        fs::write(dir.path().join("se_E3S4.safetensors"), b"x").unwrap();

        let one = resolve_weight_path(&dir.path().join("*E1S2*")).unwrap();
        assert_eq!(one, dir.path().join("se_E1S2.safetensors"));

        assert!(resolve_weight_path(&dir.path().join("se_*")).is_err());
        assert!(resolve_weight_path(&dir.path().join("missing*")).is_err());
    }
}
