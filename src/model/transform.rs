use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

const DROPOUT_P: f64 = 0.08;
const SHIFT_KERNEL: usize = 5;
const SCALE_MIN: f64 = 1.03125;
const SCALE_SPAN: f64 = 0.05;
const MAX_ANGLE_DEG: i32 = 5;

const SHARPEN: [f32; 9] = [-1., -1., -1., -1., 9., -1., -1., -1., -1.];
const SMOOTH: [f32; 9] = [1., 2., 1., 2., 4., 1., 1., 2., 1.];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perturbation {
    Dropout,
    Translate,
    ScaleCrop,
    Rotate,
    Sharpen,
    Smooth,
}

impl Perturbation {
    pub const ALL: [Perturbation; 6] = [
        Perturbation::Dropout,
        Perturbation::Translate,
        Perturbation::ScaleCrop,
        Perturbation::Rotate,
        Perturbation::Sharpen,
        Perturbation::Smooth,
    ];
}

/// Fixed, randomised composition of image perturbations.
///
/// Nothing here is trainable, but every perturbation is differentiable with
/// respect to its input so the decoder receives gradients through it.
pub struct DefinedTransform {
    channels: usize,
    device: Device,
    sharpen: Tensor, // [C, 1, 3, 3], depthwise
    smooth: Tensor,
}

impl DefinedTransform {
    pub fn new(channels: usize, device: &Device) -> Result<Self> {
        let depthwise = |taps: &[f32], scale: f64| -> Result<Tensor> {
            let k = Tensor::from_slice(taps, (1, 1, 3, 3), device)?;
            Ok(k.affine(scale, 0.0)?.repeat((channels, 1, 1, 1))?)
        };
        Ok(Self {
            channels,
            device: device.clone(),
            sharpen: depthwise(&SHARPEN, 1.0)?,
            smooth: depthwise(&SMOOTH, 0.0625)?,
        })
    }

    /// Visit every perturbation in a random order, applying each with probability 1/2.
    pub fn apply<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        let mut order = Perturbation::ALL;
        order.shuffle(rng);
        let mut y = x.clone();
        for p in order {
            if rng.gen::<f64>() >= 0.5 {
                y = self.apply_one(p, &y, rng)?;
            }
        }
        Ok(y)
    }

    pub fn apply_one<R: Rng>(&self, p: Perturbation, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        match p {
            Perturbation::Dropout => self.dropout(x, rng),
            Perturbation::Translate => self.translate(x, rng),
            Perturbation::ScaleCrop => self.scale_crop(x, rng),
            Perturbation::Rotate => {
                let b = x.dim(0)?;
                let angles: Vec<f64> = (0..b)
                    .map(|_| rng.gen_range(-MAX_ANGLE_DEG..=MAX_ANGLE_DEG) as f64)
                    .collect();
                self.rotate(x, &angles)
            }
            Perturbation::Sharpen => Ok(x.conv2d(&self.sharpen, 1, 1, 1, self.channels)?),
            Perturbation::Smooth => Ok(x.conv2d(&self.smooth, 1, 1, 1, self.channels)?),
        }
    }

    fn dropout<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        let keep = (1.0 / (1.0 - DROPOUT_P)) as f32;
        let mask: Vec<f32> = (0..x.elem_count())
            .map(|_| if rng.gen::<f64>() < DROPOUT_P { 0.0 } else { keep })
            .collect();
        let mask = Tensor::from_vec(mask, x.shape(), &self.device)?;
        Ok((x * mask)?)
    }

    /// Shift by convolving with a one-hot 5x5 kernel whose hot tap is off-centre.
    fn translate<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        let taps = SHIFT_KERNEL * SHIFT_KERNEL;
        let centre = taps / 2;
        let mut hot = rng.gen_range(0..taps - 1);
        if hot >= centre {
            hot += 1;
        }
        let mut kernel = vec![0f32; taps];
        kernel[hot] = 1.0;
        let kernel = Tensor::from_vec(kernel, (1, 1, SHIFT_KERNEL, SHIFT_KERNEL), &self.device)?
            .repeat((self.channels, 1, 1, 1))?;
        Ok(x.conv2d(&kernel, SHIFT_KERNEL / 2, 1, 1, self.channels)?)
    }

    /// Nearest-neighbour upscale followed by a random crop back to the input size.
    fn scale_crop<R: Rng>(&self, x: &Tensor, rng: &mut R) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        let scale = rng.gen::<f64>() * SCALE_SPAN + SCALE_MIN;
        let rows = self.crop_index(h, scale, rng)?;
        let cols = self.crop_index(w, scale, rng)?;
        Ok(x.index_select(&rows, 2)?.index_select(&cols, 3)?)
    }

    fn crop_index<R: Rng>(&self, len: usize, scale: f64, rng: &mut R) -> Result<Tensor> {
        let scaled = (scale * len as f64).floor() as usize;
        let offset = if scaled > len {
            rng.gen_range(0..scaled - len)
        } else {
            0
        };
        let idx: Vec<u32> = (0..len)
            .map(|i| {
                let src = ((i + offset) as f64 / scale).floor() as usize;
                src.min(len - 1) as u32
            })
            .collect();
        Ok(Tensor::from_vec(idx, len, &self.device)?)
    }

    /// Rotate each sample by its own angle (degrees) with bilinear sampling,
    /// zero padding outside the image and pixel centres at half-integers.
    pub(crate) fn rotate(&self, x: &Tensor, angles_deg: &[f64]) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let mut rotated = Vec::with_capacity(b);
        for (i, angle) in angles_deg.iter().enumerate().take(b) {
            let flat = x.get(i)?.reshape((c, h * w))?;
            let mut acc: Option<Tensor> = None;
            for (idx, weight) in bilinear_taps(h, w, angle.to_radians()) {
                let idx = Tensor::from_vec(idx, h * w, &self.device)?;
                let weight = Tensor::from_vec(weight, (1, h * w), &self.device)?;
                let term = flat.index_select(&idx, 1)?.broadcast_mul(&weight)?;
                acc = Some(match acc {
                    Some(a) => (a + term)?,
                    None => term,
                });
            }
            if let Some(a) = acc {
                rotated.push(a.reshape((c, h, w))?);
            }
        }
        Ok(Tensor::stack(&rotated, 0)?)
    }
}

/// Four (source index, weight) maps, one per bilinear corner.
fn bilinear_taps(h: usize, w: usize, theta: f64) -> Vec<(Vec<u32>, Vec<f32>)> {
    let (sin, cos) = theta.sin_cos();
    let mut taps: Vec<(Vec<u32>, Vec<f32>)> =
        (0..4).map(|_| (vec![0u32; h * w], vec![0f32; h * w])).collect();
    for i in 0..h {
        for j in 0..w {
            let yn = (2 * i + 1) as f64 / h as f64 - 1.0;
            let xn = (2 * j + 1) as f64 / w as f64 - 1.0;
            let sx = cos * xn - sin * yn;
            let sy = sin * xn + cos * yn;
            let px = ((sx + 1.0) * w as f64 - 1.0) / 2.0;
            let py = ((sy + 1.0) * h as f64 - 1.0) / 2.0;
            let (x0, y0) = (px.floor(), py.floor());
            let (fx, fy) = (px - x0, py - y0);
            let corners = [
                (y0, x0, (1.0 - fy) * (1.0 - fx)),
                (y0, x0 + 1.0, (1.0 - fy) * fx),
                (y0 + 1.0, x0, fy * (1.0 - fx)),
                (y0 + 1.0, x0 + 1.0, fy * fx),
            ];
            let out = i * w + j;
            for (k, (cy, cx, wt)) in corners.into_iter().enumerate() {
                let inside = cy >= 0.0 && cx >= 0.0 && cy < h as f64 && cx < w as f64;
                if inside {
                    taps[k].0[out] = (cy as usize * w + cx as usize) as u32;
                    taps[k].1[out] = wt as f32;
                }
            }
        }
    }
    taps
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn image(b: usize) -> Tensor {
        Tensor::rand(0f32, 1.0, (b, 3, 32, 32), &Device::Cpu).unwrap()
    }

    #[test]
    fn every_perturbation_keeps_the_shape() -> Result<()> {
        let dt = DefinedTransform::new(3, &Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(7);
        let x = image(2);
        for p in Perturbation::ALL {
            let y = dt.apply_one(p, &x, &mut rng)?;
            assert_eq!(y.dims(), x.dims(), "{:?}", p);
        }
        let y = dt.apply(&x, &mut rng)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn gradient_reaches_the_input() -> Result<()> {
        let dt = DefinedTransform::new(3, &Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(3);
        let x = Var::from_tensor(&image(2))?;
        let mut y = x.as_tensor().clone();
        for p in Perturbation::ALL {
            y = dt.apply_one(p, &y, &mut rng)?;
        }
        let grads = y.sum_all()?.backward()?;
        let g = grads.get(x.as_tensor()).expect("input gradient");
        assert_eq!(g.dims(), &[2, 3, 32, 32]);
        assert!(g.abs()?.sum_all()?.to_scalar::<f32>()? > 0.0);
        Ok(())
    }

    #[test]
    fn zero_angle_rotation_is_identity() -> Result<()> {
        let dt = DefinedTransform::new(3, &Device::Cpu)?;
        let x = image(2);
        let y = dt.rotate(&x, &[0.0, 0.0])?;
        let diff = (y - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn translation_moves_a_single_pixel() -> Result<()> {
        let dt = DefinedTransform::new(1, &Device::Cpu)?;
        let mut data = vec![0f32; 16 * 16];
        data[8 * 16 + 8] = 1.0;
        let x = Tensor::from_vec(data, (1, 1, 16, 16), &Device::Cpu)?;
        let mut rng = StdRng::seed_from_u64(11);
        let y = dt.apply_one(Perturbation::Translate, &x, &mut rng)?;
        let flat = y.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(flat.iter().filter(|v| **v == 1.0).count(), 1);
        assert_eq!(flat[8 * 16 + 8], 0.0);
        Ok(())
    }
}
