use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::model::Classifier;

const PROBE_SIGMA: f64 = 5.0;

/// Decoder input: logit-space codes and the class each one stands for.
#[derive(Debug, Clone)]
pub struct CodeBatch {
    pub codes: Tensor,  // [B, num_class] f32
    pub labels: Tensor, // [B] u32
}

/// Source of decoder inputs.
///
/// Pseudo codes mimic teacher logits: `N(0, sigma^2) + onehot * boost`, with one
/// `sigma ~ U[2, 7)` and one integer `boost ~ U[end, begin)` per batch.
pub struct CodeSampler {
    num_class: usize,
    begin: f64,
    end: f64,
    temp: f64,
    device: Device,
}

impl CodeSampler {
    pub fn new(num_class: usize, begin: f64, end: f64, temp: f64, device: &Device) -> Self {
        Self {
            num_class,
            begin,
            end,
            temp,
            device: device.clone(),
        }
    }

    pub fn sample<R: Rng>(&self, batch: usize, rng: &mut R) -> Result<CodeBatch> {
        let (codes, labels, _) = self.draw(batch, rng)?;
        Ok(CodeBatch { codes, labels })
    }

    /// Returns codes, labels and the one-hot matrix the labels came from.
    pub(crate) fn draw<R: Rng>(&self, batch: usize, rng: &mut R) -> Result<(Tensor, Tensor, Tensor)> {
        let k = self.num_class;
        let sigma = rng.gen::<f64>() * 5.0 + 2.0;
        let lo = self.end.floor() as i64;
        let hi = self.begin.floor() as i64;
        let boost = if hi > lo { rng.gen_range(lo..hi) as f64 } else { lo as f64 };
        let noise = Normal::new(0.0, sigma)?;

        let labels: Vec<u32> = (0..batch).map(|_| rng.gen_range(0..k as u32)).collect();
        let mut onehot = vec![0f32; batch * k];
        let mut codes = Vec::with_capacity(batch * k);
        for (row, &label) in labels.iter().enumerate() {
            onehot[row * k + label as usize] = 1.0;
            for c in 0..k {
                let hot = if c == label as usize { boost } else { 0.0 };
                codes.push(((noise.sample(rng) + hot) / self.temp) as f32);
            }
        }
        Ok((
            Tensor::from_vec(codes, (batch, k), &self.device)?,
            Tensor::from_vec(labels, batch, &self.device)?,
            Tensor::from_vec(onehot, (batch, k), &self.device)?,
        ))
    }

    /// Teacher logits of real (already normalized) images, divided by the temperature.
    pub fn from_teacher<C: Classifier>(
        &self,
        teacher: &C,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<CodeBatch> {
        let logits = teacher.forward(images)?.detach();
        Ok(CodeBatch {
            codes: logits.affine(1.0 / self.temp, 0.0)?,
            labels: labels.clone(),
        })
    }

    /// One probe code per class: `N(0, 5^2) + eye * begin`, labels `0..num_class`.
    /// No temperature is applied.
    pub fn probe_batch<R: Rng>(&self, rng: &mut R) -> Result<CodeBatch> {
        let k = self.num_class;
        let noise = Normal::new(0.0, PROBE_SIGMA)?;
        let mut codes = Vec::with_capacity(k * k);
        for r in 0..k {
            for c in 0..k {
                let hot = if r == c { self.begin } else { 0.0 };
                codes.push((noise.sample(rng) + hot) as f32);
            }
        }
        let labels: Vec<u32> = (0..k as u32).collect();
        Ok(CodeBatch {
            codes: Tensor::from_vec(codes, (k, k), &self.device)?,
            labels: Tensor::from_vec(labels, k, &self.device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sampler(temp: f64) -> CodeSampler {
        CodeSampler::new(10, 25.0, 20.0, temp, &Device::Cpu)
    }

    #[test]
    fn labels_are_the_onehot_argmax() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(42);
        for batch in [1, 4, 33] {
            let (codes, labels, onehot) = sampler(1.0).draw(batch, &mut rng)?;
            assert_eq!(codes.dims(), &[batch, 10]);
            assert_eq!(labels.dims(), &[batch]);
            let argmax = onehot.argmax(1)?.to_vec1::<u32>()?;
            assert_eq!(argmax, labels.to_vec1::<u32>()?);
        }
        Ok(())
    }

    #[test]
    fn temperature_divides_codes() -> Result<()> {
        let a = sampler(1.0).sample(8, &mut StdRng::seed_from_u64(9))?;
        let b = sampler(4.0).sample(8, &mut StdRng::seed_from_u64(9))?;
        let scaled = b.codes.affine(4.0, 0.0)?;
        let diff = (a.codes - scaled)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        assert_eq!(a.labels.to_vec1::<u32>()?, b.labels.to_vec1::<u32>()?);
        Ok(())
    }

    #[test]
    fn probe_batch_has_one_row_per_class() -> Result<()> {
        let probe = sampler(2.0).probe_batch(&mut StdRng::seed_from_u64(1))?;
        assert_eq!(probe.codes.dims(), &[10, 10]);
        assert_eq!(probe.labels.to_vec1::<u32>()?, (0..10).collect::<Vec<u32>>());
        // boost of 25 sits on the diagonal
        let diag: f32 = (0..10)
            .map(|i| probe.codes.get(i)?.get(i)?.to_scalar::<f32>())
            .sum::<candle_core::Result<f32>>()?;
        assert!(diag / 10.0 > 15.0);
        Ok(())
    }
}
