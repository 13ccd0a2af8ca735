use anyhow::{anyhow, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

use super::artifacts::{
    checkpoint_name, find_pretrained_decoder, image_name, save_image_tensor, RunLayout,
};
use super::loss::{small_encoder_loss, LossContext};
use crate::config::TrainConfig;
use crate::data::{
    epoch_batches, flip_and_pad_crop, ordered_batches, CodeBatch, CodeSampler, ImageDataset,
};
use crate::error::KtError;
use crate::model::{
    Classifier, CodeDecoder, DefinedTransform, EmaTracker, ImageDecoder, Network, Normalize,
    SmallEncoder, TeacherEncoder,
};

const TRAIN_CROP_PAD: usize = 4;

/// The fixed teacher and every trainable network of a run, in index order.
pub struct Networks {
    pub teacher: Network<TeacherEncoder>,
    pub decoders: Vec<Network<ImageDecoder>>,
    pub small_encoders: Vec<Network<SmallEncoder>>,
}

impl Networks {
    /// Teacher from `e1` (fixed), every small encoder from `e2`, decoder `i` from
    /// the single file in `pretrained_dir` tagged `_d<i>_` and `pretrained_timeid`.
    pub fn build(cfg: &TrainConfig, device: &Device) -> Result<Self> {
        let (c, size, k) = (cfg.image_channels, cfg.image_size, cfg.num_class);
        let teacher = Network::build(device, cfg.e1.as_deref(), true, |vb| {
            TeacherEncoder::new(vb, c, size, k)
        })
        .context("build teacher")?;

        let mut decoders = Vec::with_capacity(cfg.num_dec);
        for i in 1..=cfg.num_dec {
            let weights = match (&cfg.pretrained_dir, &cfg.pretrained_timeid) {
                (Some(dir), Some(timeid)) => Some(find_pretrained_decoder(dir, timeid, i)?),
                _ => None,
            };
            let dec = Network::build(device, weights.as_deref(), false, |vb| {
                ImageDecoder::new(vb, cfg.code_dim(), size, c, cfg.gray)
            })
            .with_context(|| format!("build decoder {}", i))?;
            decoders.push(dec);
        }

        let mut small_encoders = Vec::with_capacity(cfg.num_se);
        for i in 1..=cfg.num_se {
            let se = Network::build(device, cfg.e2.as_deref(), false, |vb| {
                SmallEncoder::new(vb, c, size, k)
            })
            .with_context(|| format!("build small encoder {}", i))?;
            small_encoders.push(se);
        }

        Ok(Self {
            teacher,
            decoders,
            small_encoders,
        })
    }
}

/// A trainable network with its own optimizer and EMA shadows.
struct Trainee<M> {
    net: Network<M>,
    vars: Vec<(String, Var)>,
    opt: AdamW,
    ema: Option<EmaTracker>,
}

impl<M> Trainee<M> {
    fn new(net: Network<M>, cfg: &TrainConfig) -> Result<Self> {
        let vars = net.trainable_vars()?;
        let params = ParamsAdamW {
            lr: cfg.lr,
            beta1: cfg.b1,
            beta2: cfg.b2,
            eps: 1e-8,
            weight_decay: 0.0,
        };
        let opt = AdamW::new(vars.iter().map(|(_, v)| v.clone()).collect(), params)?;
        let ema = if cfg.use_ema {
            Some(net.ema_tracker(cfg.ema_factor)?)
        } else {
            None
        };
        Ok(Self {
            net,
            vars,
            opt,
            ema,
        })
    }

    /// Optimizer step, then every parameter becomes its EMA.
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.opt.step(grads)?;
        if let Some(ema) = self.ema.as_mut() {
            ema.apply(&self.vars)?;
        }
        Ok(())
    }
}

/// Scalars of one training step, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub dec_hard: Vec<f32>,
    pub dec_acc: Vec<f64>,
    pub dec_objective: Vec<f32>,
    /// `[small encoder][decoder]`
    pub se_hard: Vec<Vec<f32>>,
    pub se_acc: Vec<Vec<f64>>,
    pub se_loss: Vec<f32>,
    /// Last decoder's regularizers and perceptual terms.
    pub tv: f32,
    pub img_norm: f32,
    pub perceptual: Vec<f32>,
    pub adv: f32,
    pub ave_hard: Option<f32>,
}

impl StepReport {
    /// `E{e}S{s} | dec: ... | se: ... | tv: .. norm: .. p: ... ({t}s/step)`
    pub fn format_line(&self, epoch: usize, step: usize, secs_per_step: f64) -> String {
        let mut line = format!("E{}S{} | dec:", epoch, step);
        for (h, a) in self.dec_hard.iter().zip(&self.dec_acc) {
            line.push_str(&format!(" {:.4}({:.3})", h, a));
        }
        line.push_str(" | se:");
        if let (Some(hard), Some(acc)) = (self.se_hard.first(), self.se_acc.first()) {
            for (h, a) in hard.iter().zip(acc) {
                line.push_str(&format!(" {:.4}({:.3})", h, a));
            }
        }
        line.push_str(&format!(" | tv: {:.4} norm: {:.4} p:", self.tv, self.img_norm));
        for p in &self.perceptual {
            line.push_str(&format!(" {:.4}", p));
        }
        line.push_str(&format!(" ({:.3}s/step)", secs_per_step));
        line
    }
}

/// Per-decoder gradient stores plus the detached reconstructions the small
/// encoders train on.
struct DecoderPass {
    grads: Vec<GradStore>,
    recons: Vec<Tensor>,
    recons_dt: Vec<Tensor>,
}

pub struct Trainer {
    cfg: TrainConfig,
    device: Device,
    teacher: Network<TeacherEncoder>,
    decoders: Vec<Trainee<ImageDecoder>>,
    small_encoders: Vec<Trainee<SmallEncoder>>,
    normalize: Normalize,
    transform: DefinedTransform,
    sampler: CodeSampler,
    rng: StdRng,
    layout: RunLayout,
    last_log: Instant,
}

impl Trainer {
    pub fn new(cfg: TrainConfig, nets: Networks, layout: RunLayout, device: &Device) -> Result<Self> {
        cfg.validate()?;
        let teacher_channels = nets.teacher.module().in_channels();
        for (i, dec) in nets.decoders.iter().enumerate() {
            if dec.module().out_channels() != teacher_channels {
                return Err(KtError::ShapeMismatch {
                    what: format!("decoder {} output channels vs teacher input", i + 1),
                    expected: vec![teacher_channels],
                    got: vec![dec.module().out_channels()],
                }
                .into());
            }
        }
        let decoders = nets
            .decoders
            .into_iter()
            .map(|n| Trainee::new(n, &cfg))
            .collect::<Result<Vec<_>>>()?;
        let small_encoders = nets
            .small_encoders
            .into_iter()
            .map(|n| Trainee::new(n, &cfg))
            .collect::<Result<Vec<_>>>()?;
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            normalize: Normalize::new(&cfg.norm_mean, &cfg.norm_std, device)?,
            transform: DefinedTransform::new(cfg.image_channels, device)?,
            sampler: CodeSampler::new(cfg.num_class, cfg.begin, cfg.end, cfg.temp, device),
            teacher: nets.teacher,
            decoders,
            small_encoders,
            rng,
            layout,
            device: device.clone(),
            cfg,
            last_log: Instant::now(),
        })
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn decoder(&self, i: usize) -> Option<&Network<ImageDecoder>> {
        self.decoders.get(i).map(|t| &t.net)
    }

    pub fn small_encoder(&self, i: usize) -> Option<&Network<SmallEncoder>> {
        self.small_encoders.get(i).map(|t| &t.net)
    }

    /// One step: decoders (two-phase backward), then small encoders.
    ///
    /// `real` carries `(images in [0, 1], labels)` and is required when codes
    /// come from the teacher instead of the sampler.
    pub fn train_step(&mut self, real: Option<(&Tensor, &Tensor)>) -> Result<StepReport> {
        let codes = if self.cfg.use_pseudo_code {
            self.sampler.sample(self.cfg.batch_size, &mut self.rng)?
        } else {
            let (images, labels) =
                real.ok_or_else(|| anyhow!("real-forward mode needs an image batch"))?;
            let x = self.normalize.forward(images)?;
            self.sampler.from_teacher(self.teacher.module(), &x, labels)?
        };

        let mut report = StepReport::default();
        let pass = self.decoder_pass(&codes, &mut report)?;
        for (dec, store) in self.decoders.iter_mut().zip(&pass.grads) {
            dec.step(store)?;
        }

        for se in self.small_encoders.iter_mut() {
            let terms = small_encoder_loss(
                se.net.module(),
                &pass.recons,
                &pass.recons_dt,
                &codes.labels,
                &self.normalize,
                &self.cfg.loss,
            )?;
            let se_grads = terms.loss.backward()?;
            se.step(&se_grads)?;
            report.se_loss.push(terms.loss.to_scalar::<f32>()?);
            report.se_hard.push(terms.hard);
            report.se_acc.push(terms.train_acc);
        }
        Ok(report)
    }

    /// Decoder gradients of one step, without touching any parameter.
    ///
    /// Phase 1 runs one backward per decoder. With the averaged image enabled,
    /// phase 2 backpropagates its loss once and adds the result into every
    /// decoder's store.
    fn decoder_pass(&mut self, codes: &CodeBatch, report: &mut StepReport) -> Result<DecoderPass> {
        let ctx = LossContext {
            teacher: self.teacher.module(),
            normalize: &self.normalize,
            transform: &self.transform,
            weights: &self.cfg.loss,
            temp: self.cfg.temp,
            soft_target: self.cfg.soft_target,
        };
        let se_modules: Vec<&SmallEncoder> =
            self.small_encoders.iter().map(|t| t.net.module()).collect();

        let n = self.decoders.len();
        let mut grads: Vec<GradStore> = Vec::with_capacity(n);
        // attached only while the averaged-image phase still needs the graph
        let mut recons: Vec<Tensor> = Vec::with_capacity(n);
        let mut recons_dt: Vec<Tensor> = Vec::with_capacity(n);

        for dec in &self.decoders {
            let terms = ctx.decoder_terms(dec.net.module(), &se_modules, codes, &mut self.rng)?;
            grads.push(terms.objective.backward()?);

            report.dec_hard.push(terms.hard.to_scalar::<f32>()?);
            report.dec_acc.push(terms.train_acc);
            report.dec_objective.push(terms.objective.to_scalar::<f32>()?);
            report.tv = terms.tv.to_scalar::<f32>()?;
            report.img_norm = terms.img_norm.to_scalar::<f32>()?;
            report.perceptual = terms
                .perceptual
                .iter()
                .map(|p| p.to_scalar::<f32>())
                .collect::<candle_core::Result<_>>()?;
            report.adv = terms.adv.to_scalar::<f32>()?;

            recons.push(if self.cfg.use_ave_img {
                terms.recon
            } else {
                terms.recon.detach()
            });
            recons_dt.push(terms.recon_dt.detach());
        }

        if self.cfg.use_ave_img {
            let ave = ctx.average_image_loss(&recons, &codes.labels)?;
            let ave_grads = ave.backward()?;
            for (dec, store) in self.decoders.iter().zip(grads.iter_mut()) {
                merge_grads(store, &ave_grads, &dec.vars)?;
            }
            report.ave_hard = Some(ave.to_scalar::<f32>()?);
        }

        Ok(DecoderPass {
            grads,
            recons: recons.iter().map(Tensor::detach).collect(),
            recons_dt,
        })
    }

    /// Run every decoder on each probe code and write one JPEG per pair.
    pub fn save_images(&mut self, epoch: usize, step: usize) -> Result<Vec<PathBuf>> {
        let probe = self.sampler.probe_batch(&mut self.rng)?;
        let labels = probe.labels.to_vec1::<u32>()?;
        let mut written = Vec::with_capacity(labels.len() * self.decoders.len());
        for (i, label) in labels.iter().enumerate() {
            let code = probe.codes.narrow(0, i, 1)?;
            for (di, dec) in self.decoders.iter().enumerate() {
                let img = dec.net.module().forward(&code)?.detach();
                let name = image_name(&self.layout.run_tag, epoch, step, i, *label, di + 1);
                let path = self.layout.image_dir.join(name);
                save_image_tensor(&img, &path)
                    .with_context(|| format!("write image {:?}", path))?;
                written.push(path);
            }
        }
        Ok(written)
    }

    /// Accuracy of small encoder #1 on `eval`, then checkpoints of small
    /// encoder #1 and every decoder.
    pub fn test_and_checkpoint(
        &mut self,
        epoch: usize,
        step: usize,
        eval: Option<&dyn ImageDataset>,
    ) -> Result<(Option<f64>, Vec<PathBuf>)> {
        let se1 = self
            .small_encoders
            .first()
            .ok_or_else(|| anyhow!("no small encoder to test"))?;
        let acc = match eval {
            Some(ds) if !ds.is_empty() => {
                let mut correct = 0f64;
                for idx in ordered_batches(ds.len(), self.cfg.test_batch_size) {
                    let (images, labels) = ds.batch(&idx, &self.device)?;
                    let logits = se1.net.module().forward(&self.normalize.forward(&images)?)?;
                    correct += super::loss::accuracy(&logits, &labels)? * idx.len() as f64;
                }
                let acc = correct / ds.len() as f64;
                info!(
                    "E{}S{} | =======> test accuracy on SE: {:.4}",
                    epoch, step, acc
                );
                Some(acc)
            }
            _ => {
                warn!(
                    "E{}S{} | no evaluation set, checkpointing without test accuracy",
                    epoch, step
                );
                None
            }
        };

        let tag = &self.layout.run_tag;
        let mut written = Vec::with_capacity(1 + self.decoders.len());
        let path = self
            .layout
            .weights_dir
            .join(checkpoint_name(tag, "se", None, epoch, step, acc));
        se1.net.save(&path)?;
        written.push(path);
        for (i, dec) in self.decoders.iter().enumerate() {
            let path = self
                .layout
                .weights_dir
                .join(checkpoint_name(tag, "d", Some(i + 1), epoch, step, None));
            dec.net.save(&path)?;
            written.push(path);
        }
        Ok((acc, written))
    }

    /// Emit the metrics line; time per step is measured since the previous line.
    pub fn log_metrics(&mut self, epoch: usize, step: usize, report: &StepReport) {
        let secs = self.last_log.elapsed().as_secs_f64() / self.cfg.show_interval as f64;
        info!("{}", report.format_line(epoch, step, secs));
        self.last_log = Instant::now();
    }

    /// Steps in one epoch: the override, else one pass over the training set.
    pub fn steps_per_epoch(&self, train: Option<&dyn ImageDataset>) -> Result<usize> {
        if let Some(n) = self.cfg.steps_per_epoch {
            return Ok(n);
        }
        match train {
            Some(ds) if !ds.is_empty() => Ok(ds.len().div_ceil(self.cfg.batch_size)),
            _ => Err(KtError::Config(
                "steps_per_epoch is required without a training set".into(),
            )
            .into()),
        }
    }

    /// Epochs `start_epoch..num_epoch`, every step index from zero.
    pub fn run(
        &mut self,
        train: Option<&dyn ImageDataset>,
        eval: Option<&dyn ImageDataset>,
        start_epoch: usize,
    ) -> Result<()> {
        if !self.cfg.use_pseudo_code && train.map_or(true, |ds| ds.is_empty()) {
            return Err(KtError::Config("real-forward mode needs a training set".into()).into());
        }
        let steps = self.steps_per_epoch(train)?;
        info!(
            "training {} decoders / {} small encoders, epochs {}..{}, {} steps per epoch",
            self.decoders.len(),
            self.small_encoders.len(),
            start_epoch,
            self.cfg.num_epoch,
            steps
        );
        self.last_log = Instant::now();
        for epoch in start_epoch..self.cfg.num_epoch {
            let order = match (self.cfg.use_pseudo_code, train) {
                (false, Some(ds)) => epoch_batches(ds.len(), self.cfg.batch_size, &mut self.rng),
                _ => Vec::new(),
            };
            for step in 0..steps {
                let real = match (order.is_empty(), train) {
                    (false, Some(ds)) => {
                        let (images, labels) = ds.batch(&order[step % order.len()], &self.device)?;
                        let images = flip_and_pad_crop(&images, TRAIN_CROP_PAD, &mut self.rng)?;
                        Some((images, labels))
                    }
                    _ => None,
                };
                let report = self.train_step(real.as_ref().map(|(x, y)| (x, y)))?;

                if step % self.cfg.save_interval == 0 {
                    self.save_images(epoch, step)?;
                }
                if step % self.cfg.test_interval == 0 {
                    self.test_and_checkpoint(epoch, step, eval)?;
                }
                if step % self.cfg.show_interval == 0 {
                    self.log_metrics(epoch, step, &report);
                }
            }
        }
        info!("training finished");
        Ok(())
    }
}

/// Add every gradient `extra` holds for `vars` into `store`.
fn merge_grads(store: &mut GradStore, extra: &GradStore, vars: &[(String, Var)]) -> Result<()> {
    for (_, var) in vars {
        let Some(g2) = extra.get(var.as_tensor()) else {
            continue;
        };
        let merged = match store.get(var.as_tensor()) {
            Some(g1) => (g1 + g2)?,
            None => g2.clone(),
        };
        store.insert(var.as_tensor(), merged);
    }
    Ok(())
}
