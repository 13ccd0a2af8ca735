use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{loss, ops};
use rand::Rng;

use crate::config::LossWeights;
use crate::data::CodeBatch;
use crate::error::KtError;
use crate::model::{BranchClassifier, Classifier, CodeDecoder, DefinedTransform, Normalize};

/// Everything one decoder's loss needs besides the decoder itself.
pub struct LossContext<'a, T> {
    pub teacher: &'a T,
    pub normalize: &'a Normalize,
    pub transform: &'a DefinedTransform,
    pub weights: &'a LossWeights,
    pub temp: f64,
    pub soft_target: bool,
}

/// Per-decoder loss terms of one step. Weights are already applied.
pub struct DecoderTerms {
    /// R1, attached to the decoder graph.
    pub recon: Tensor,
    /// R1 after the defined transform, attached.
    pub recon_dt: Tensor,
    /// Teacher logits of R1.
    pub logits: Tensor,
    pub tv: Tensor,
    pub img_norm: Tensor,
    pub perceptual: Vec<Tensor>,
    pub hard: Tensor,
    pub hard_dt: Tensor,
    pub class: Tensor,
    pub soft: Tensor,
    pub adv: Tensor,
    /// The backpropagated sum.
    pub objective: Tensor,
    pub train_acc: f64,
}

impl<'a, T: BranchClassifier> LossContext<'a, T> {
    pub fn decoder_terms<D, S, R>(
        &self,
        decoder: &D,
        small_encoders: &[&S],
        codes: &CodeBatch,
        rng: &mut R,
    ) -> Result<DecoderTerms>
    where
        D: CodeDecoder,
        S: Classifier,
        R: Rng,
    {
        if decoder.out_channels() != self.teacher.in_channels() {
            return Err(KtError::ShapeMismatch {
                what: "decoder output channels vs teacher input".into(),
                expected: vec![self.teacher.in_channels()],
                got: vec![decoder.out_channels()],
            }
            .into());
        }
        let w = self.weights;
        let labels = &codes.labels;

        let recon = decoder.forward(&codes.codes)?;
        let feats1 = self.teacher.forward_branch(&self.normalize.forward(&recon)?)?;
        let logits = last(&feats1)?.clone();

        let recon2 = decoder.forward(&logits)?;
        let feats2 = self.teacher.forward_branch(&self.normalize.forward(&recon2)?)?;

        let recon_dt = self.transform.apply(&recon, rng)?;
        let logits_dt = self.teacher.forward(&self.normalize.forward(&recon_dt)?)?;

        let tv = total_variation(&recon)?.affine(w.tv, 0.0)?;
        let img_norm = sixth_power_norm(&recon)?.affine(w.norm, 0.0)?;
        let perceptual = perceptual_loss(&feats2, &feats1, w.perc)?;
        let hard = cross_entropy(&logits, labels)?.affine(w.hard, 0.0)?;
        let hard_dt = cross_entropy(&logits_dt, labels)?.affine(w.da, 0.0)?;
        let class = class_score_loss(&logits, labels, w.class)?;
        let soft = soft_target_loss(&logits, &codes.codes, self.temp, w.soft)?;

        // logged only
        let detached = recon.detach();
        let mut adv = Tensor::zeros((), DType::F32, recon.device())?;
        for se in small_encoders {
            let ce = cross_entropy(&se.forward(&detached)?, labels)?;
            adv = (adv + ce.recip()?.affine(w.adv, 0.0)?)?;
        }

        let mut objective = ((&class + &hard)? + &hard_dt)?;
        if self.soft_target {
            objective = (objective + &soft)?;
        }
        let train_acc = accuracy(&logits, labels)?;

        Ok(DecoderTerms {
            recon,
            recon_dt,
            logits,
            tv,
            img_norm,
            perceptual,
            hard,
            hard_dt,
            class,
            soft,
            adv,
            objective,
            train_acc,
        })
    }

    /// Hard-label loss of the decoder-averaged image. The average is fed to the
    /// teacher as is, without normalization.
    pub fn average_image_loss(&self, recons: &[Tensor], labels: &Tensor) -> Result<Tensor> {
        let stacked = Tensor::stack(recons, 0)?;
        let ave = stacked.mean(0)?;
        let logits = self.teacher.forward(&ave)?;
        Ok(cross_entropy(&logits, labels)?.affine(self.weights.hard, 0.0)?)
    }
}

fn last(feats: &[Tensor]) -> Result<&Tensor> {
    feats
        .last()
        .ok_or_else(|| anyhow::anyhow!("classifier returned no branches"))
}

/// Small-encoder loss over every decoder's detached reconstruction and its
/// transformed variant, with per-decoder hard loss and accuracy.
pub struct SmallEncoderTerms {
    pub loss: Tensor,
    pub hard: Vec<f32>,
    pub train_acc: Vec<f64>,
}

pub fn small_encoder_loss<S: Classifier>(
    se: &S,
    recons: &[Tensor],
    recons_dt: &[Tensor],
    labels: &Tensor,
    normalize: &Normalize,
    weights: &LossWeights,
) -> Result<SmallEncoderTerms> {
    let mut loss: Option<Tensor> = None;
    let mut hard_values = Vec::with_capacity(recons.len());
    let mut accs = Vec::with_capacity(recons.len());
    for (r, r_dt) in recons.iter().zip(recons_dt) {
        let logits = se.forward(&normalize.forward(&r.detach())?)?;
        let logits_dt = se.forward(&normalize.forward(&r_dt.detach())?)?;
        let hard = cross_entropy(&logits, labels)?.affine(weights.hard, 0.0)?;
        let hard_dt = cross_entropy(&logits_dt, labels)?.affine(weights.da, 0.0)?;
        hard_values.push(hard.to_scalar::<f32>()?);
        accs.push(accuracy(&logits, labels)?);
        let term = (hard + hard_dt)?;
        loss = Some(match loss {
            Some(l) => (l + term)?,
            None => term,
        });
    }
    let loss = loss.ok_or_else(|| anyhow::anyhow!("no reconstructions for the small encoder"))?;
    Ok(SmallEncoderTerms {
        loss,
        hard: hard_values,
        train_acc: accs,
    })
}

/// Mean cross-entropy over raw logits and `u32` class indices.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    Ok(loss::cross_entropy(logits, labels)?)
}

/// Sum of absolute horizontal and vertical neighbour differences (unweighted).
pub fn total_variation(img: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = img.dims4()?;
    let dx = (img.narrow(3, 0, w - 1)? - img.narrow(3, 1, w - 1)?)?
        .abs()?
        .sum_all()?;
    let dy = (img.narrow(2, 0, h - 1)? - img.narrow(2, 1, h - 1)?)?
        .abs()?
        .sum_all()?;
    Ok((dx + dy)?)
}

/// `sum(x^6)`, i.e. the 6-norm raised to the sixth power (unweighted).
pub fn sixth_power_norm(img: &Tensor) -> Result<Tensor> {
    let sq = img.sqr()?;
    Ok((sq.sqr()? * sq)?.sum_all()?)
}

/// MSE between `f2[k]` and detached `f1[k]` for every branch but the last.
pub fn perceptual_loss(f2: &[Tensor], f1: &[Tensor], weight: f64) -> Result<Vec<Tensor>> {
    let n = f1.len().min(f2.len()).saturating_sub(1);
    (0..n)
        .map(|k| -> Result<Tensor> { Ok(loss::mse(&f2[k], &f1[k].detach())?.affine(weight, 0.0)?) })
        .collect()
}

/// `-weight * sum_b logits[b, label_b]`.
pub fn class_score_loss(logits: &Tensor, labels: &Tensor, weight: f64) -> Result<Tensor> {
    let picked = logits.gather(&labels.unsqueeze(1)?.contiguous()?, 1)?;
    Ok(picked.sum_all()?.affine(-weight, 0.0)?)
}

/// `KL(softmax(codes) || softmax(logits / T)) * T^2 * weight`, averaged over all entries.
pub fn soft_target_loss(logits: &Tensor, codes: &Tensor, temp: f64, weight: f64) -> Result<Tensor> {
    let log_prob = ops::log_softmax(&logits.affine(1.0 / temp, 0.0)?, D::Minus1)?;
    let target_log = ops::log_softmax(&codes.detach(), D::Minus1)?;
    let target = target_log.exp()?;
    let kl = (target * (target_log - log_prob)?)?.mean_all()?;
    Ok(kl.affine(temp * temp * weight, 0.0)?)
}

/// Fraction of rows whose argmax equals the label.
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> Result<f64> {
    let pred = logits.argmax(D::Minus1)?;
    let hits = pred
        .eq(labels)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as f64 / labels.dim(0)? as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CodeSampler;
    use crate::model::{ImageDecoder, Network, SmallEncoder, TeacherEncoder};
    use approx::assert_relative_eq;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Logits are the per-channel means of the image.
    struct ChannelMean;

    impl Classifier for ChannelMean {
        fn forward(&self, image: &Tensor) -> Result<Tensor> {
            Ok(image.flatten_from(2)?.mean(2)?)
        }

        fn in_channels(&self) -> usize {
            3
        }
    }

    fn solid(rgb: [f32; 3]) -> Result<Tensor> {
        Ok(Tensor::new(&rgb, &Device::Cpu)?
            .reshape((1, 3, 1, 1))?
            .broadcast_as((1, 3, 2, 2))?
            .contiguous()?)
    }

    #[test]
    fn decoder_objective_is_class_hard_and_transformed_hard() -> Result<()> {
        let dev = Device::Cpu;
        let teacher = Network::build(&dev, None, true, |vb| TeacherEncoder::new(vb, 3, 32, 10))?;
        let decoder = Network::build(&dev, None, false, |vb| {
            ImageDecoder::new(vb, 10, 32, 3, false)
        })?;
        let se = Network::build(&dev, None, false, |vb| SmallEncoder::new(vb, 3, 32, 10))?;
        let normalize = Normalize::new(&[0.485, 0.456, 0.406], &[0.229, 0.224, 0.225], &dev)?;
        let transform = DefinedTransform::new(3, &dev)?;
        let weights = LossWeights::default();
        let mut rng = StdRng::seed_from_u64(4);
        let codes = CodeSampler::new(10, 25.0, 20.0, 1.0, &dev).sample(4, &mut rng)?;

        for soft_target in [false, true] {
            let ctx = LossContext {
                teacher: teacher.module(),
                normalize: &normalize,
                transform: &transform,
                weights: &weights,
                temp: 1.0,
                soft_target,
            };
            let terms = ctx.decoder_terms(decoder.module(), &[se.module()], &codes, &mut rng)?;
            let v = |t: &Tensor| t.to_scalar::<f32>();
            let mut expected = (v(&terms.class)? + v(&terms.hard)?) + v(&terms.hard_dt)?;
            if soft_target {
                expected += v(&terms.soft)?;
            }
            assert_eq!(v(&terms.objective)?, expected);
            // computed but never part of the objective
            assert!(v(&terms.adv)? > 0.0);
            assert!(v(&terms.soft)? > 0.0);
        }
        Ok(())
    }

    #[test]
    fn small_encoder_loss_sums_weighted_terms_over_decoders() -> Result<()> {
        let normalize = Normalize::new(&[0.0; 3], &[1.0; 3], &Device::Cpu)?;
        let weights = LossWeights::default();
        let labels = Tensor::new(&[0u32], &Device::Cpu)?;
        let recons = [solid([1.0, 0.0, 0.0])?, solid([0.0, 1.0, 0.0])?];
        let recons_dt = [solid([0.0; 3])?, solid([0.0; 3])?];

        let terms =
            small_encoder_loss(&ChannelMean, &recons, &recons_dt, &labels, &normalize, &weights)?;

        let e = std::f64::consts::E;
        let ce_hit = (e + 2.0).ln() - 1.0;
        let ce_miss = (e + 2.0).ln();
        let ce_flat = 3f64.ln();
        let expected = weights.hard * (ce_hit + ce_miss) + weights.da * 2.0 * ce_flat;
        assert_relative_eq!(terms.loss.to_scalar::<f32>()? as f64, expected, epsilon = 1e-4);
        assert_relative_eq!(terms.hard[0] as f64, weights.hard * ce_hit, epsilon = 1e-5);
        assert_relative_eq!(terms.hard[1] as f64, weights.hard * ce_miss, epsilon = 1e-5);
        assert_eq!(terms.train_acc, vec![1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn tv_is_zero_only_for_constant_images() -> Result<()> {
        let flat = Tensor::full(0.3f32, (2, 3, 8, 8), &Device::Cpu)?;
        assert_eq!(total_variation(&flat)?.to_scalar::<f32>()?, 0.0);

        let mut data = vec![0.3f32; 2 * 3 * 8 * 8];
        data[17] = 0.4;
        let bumped = Tensor::from_vec(data, (2, 3, 8, 8), &Device::Cpu)?;
        assert!(total_variation(&bumped)?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn tv_counts_both_directions() -> Result<()> {
        // [[0, 1], [0, 1]]: two horizontal steps of 1, no vertical ones
        let img = Tensor::new(&[[[[0f32, 1.], [0., 1.]]]], &Device::Cpu)?;
        assert_eq!(total_variation(&img)?.to_scalar::<f32>()?, 2.0);
        Ok(())
    }

    #[test]
    fn perceptual_is_zero_for_equal_branches() -> Result<()> {
        let f: Vec<Tensor> = (0..4)
            .map(|i| Tensor::rand(0f32, 1.0, (2, i + 3), &Device::Cpu))
            .collect::<candle_core::Result<_>>()?;
        let p = perceptual_loss(&f, &f, 1.0)?;
        assert_eq!(p.len(), 3);
        for t in p {
            assert_eq!(t.to_scalar::<f32>()?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn sixth_power_norm_matches_hand_value() -> Result<()> {
        let x = Tensor::new(&[-1f32, 2.0, 0.5], &Device::Cpu)?;
        let v = sixth_power_norm(&x)?.to_scalar::<f32>()?;
        assert_relative_eq!(v, 1.0 + 64.0 + 0.015625, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn class_score_picks_label_logits() -> Result<()> {
        let logits = Tensor::new(&[[1f32, 5.0, 2.0], [4.0, 0.0, 3.0]], &Device::Cpu)?;
        let labels = Tensor::new(&[1u32, 2], &Device::Cpu)?;
        let v = class_score_loss(&logits, &labels, 10.0)?.to_scalar::<f32>()?;
        assert_relative_eq!(v, -80.0);
        assert_relative_eq!(accuracy(&logits, &labels)?, 0.5);
        Ok(())
    }

    #[test]
    fn soft_target_vanishes_when_distributions_agree() -> Result<()> {
        let codes = Tensor::new(&[[1f32, 2.0, 3.0]], &Device::Cpu)?;
        let v = soft_target_loss(&codes, &codes, 1.0, 10.0)?.to_scalar::<f32>()?;
        assert!(v.abs() < 1e-6);
        let other = Tensor::new(&[[3f32, 2.0, 1.0]], &Device::Cpu)?;
        assert!(soft_target_loss(&other, &codes, 1.0, 10.0)?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }
}
