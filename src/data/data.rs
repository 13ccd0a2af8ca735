use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// Labelled image collection with random access by index.
pub trait ImageDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(images [B, C, H, W] f32 in [0, 1], labels [B] u32)` for the given indices.
    fn batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)>;
}

/// Images stored contiguously in CHW order.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    pixels: Vec<f32>,
    labels: Vec<u32>,
    shape: (usize, usize, usize),
}

impl InMemoryDataset {
    pub fn new(pixels: Vec<f32>, labels: Vec<u32>, shape: (usize, usize, usize)) -> Result<Self> {
        let (c, h, w) = shape;
        if pixels.len() != labels.len() * c * h * w {
            bail!(
                "{} pixel values do not make {} images of {:?}",
                pixels.len(),
                labels.len(),
                shape
            );
        }
        Ok(Self {
            pixels,
            labels,
            shape,
        })
    }
}

impl ImageDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let (c, h, w) = self.shape;
        let per = c * h * w;
        let mut pix = Vec::with_capacity(indices.len() * per);
        let mut lab = Vec::with_capacity(indices.len());
        for &i in indices {
            if i >= self.labels.len() {
                bail!("index {} out of range for {} images", i, self.labels.len());
            }
            pix.extend_from_slice(&self.pixels[i * per..(i + 1) * per]);
            lab.push(self.labels[i]);
        }
        let images = Tensor::from_vec(pix, (indices.len(), c, h, w), device)?;
        let labels = Tensor::from_vec(lab, indices.len(), device)?;
        Ok((images, labels))
    }
}

/// Shuffled index chunks covering `len` items once; the last chunk may be short.
pub fn epoch_batches<R: Rng>(len: usize, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut idx: Vec<usize> = (0..len).collect();
    idx.shuffle(rng);
    idx.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Sequential index chunks, for evaluation.
pub fn ordered_batches(len: usize, batch_size: usize) -> Vec<Vec<usize>> {
    let idx: Vec<usize> = (0..len).collect();
    idx.chunks(batch_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Training augmentation: random horizontal flip, then a random crop of the
/// zero-padded image back to its original size.
pub fn flip_and_pad_crop<R: Rng>(images: &Tensor, pad: usize, rng: &mut R) -> Result<Tensor> {
    let (b, _, h, w) = images.dims4()?;
    let reversed: Vec<u32> = (0..w as u32).rev().collect();
    let reversed = Tensor::from_vec(reversed, w, images.device())?;
    let mut out = Vec::with_capacity(b);
    for i in 0..b {
        let mut x = images.narrow(0, i, 1)?;
        if rng.gen_bool(0.5) {
            x = x.index_select(&reversed, 3)?;
        }
        if pad > 0 {
            let padded = x.pad_with_zeros(2, pad, pad)?.pad_with_zeros(3, pad, pad)?;
            let top = rng.gen_range(0..=2 * pad);
            let left = rng.gen_range(0..=2 * pad);
            x = padded.narrow(2, top, h)?.narrow(3, left, w)?;
        }
        out.push(x);
    }
    Ok(Tensor::cat(&out, 0)?)
}
