//! CIFAR-10 splits loaded through `candle_datasets::vision::cifar`.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_datasets::vision;
use std::path::Path;

use super::data::ImageDataset;

/// ITU-R BT.601 luma weights.
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

/// One split held as host tensors: images `[N, 3, 32, 32]` in `[0, 1]`, labels `[N]` u32.
pub struct Cifar10Dataset {
    images: Tensor,
    labels: Tensor,
    len: usize,
}

impl Cifar10Dataset {
    /// `(train, test)` from the binary batches in `dir`. `gray` replaces every
    /// test pixel with its luminance, replicated over the three channels.
    pub fn load(dir: &Path, gray: bool) -> Result<(Self, Self)> {
        let ds = vision::cifar::load_dir(dir)
            .with_context(|| format!("load CIFAR-10 from {:?}", dir))?;
        Self::from_vision(ds, gray)
    }

    pub fn from_vision(ds: vision::Dataset, gray: bool) -> Result<(Self, Self)> {
        let train = Self::new(ds.train_images, &ds.train_labels)?;
        let test_images = if gray {
            luminance(&ds.test_images)?
        } else {
            ds.test_images
        };
        let test = Self::new(test_images, &ds.test_labels)?;
        Ok((train, test))
    }

    fn new(images: Tensor, labels: &Tensor) -> Result<Self> {
        let (len, _, _, _) = images.dims4()?;
        if labels.dims1()? != len {
            bail!("{} images but {} labels", len, labels.dims1()?);
        }
        Ok(Self {
            images: images.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
            len,
        })
    }
}

/// `[N, 3, H, W]` -> luminance replicated over three channels.
fn luminance(images: &Tensor) -> Result<Tensor> {
    let weights = Tensor::from_slice(&LUMA, (1, 3, 1, 1), images.device())?;
    let y = images.broadcast_mul(&weights)?.sum_keepdim(1)?;
    Ok(Tensor::cat(&[&y, &y, &y], 1)?)
}

impl ImageDataset for Cifar10Dataset {
    fn len(&self) -> usize {
        self.len
    }

    fn batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len) {
            bail!("index {} out of range for {} images", bad, self.len);
        }
        let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, indices.len(), self.images.device())?;
        let images = self.images.index_select(&idx, 0)?.to_device(device)?;
        let labels = self.labels.index_select(&idx, 0)?.to_device(device)?;
        Ok((images, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Images whose three channels are constant at `rgb[i]`.
    fn solid(rgb: &[[f32; 3]]) -> Result<Tensor> {
        let n = rgb.len();
        let flat: Vec<f32> = rgb.iter().flat_map(|c| c.iter().copied()).collect();
        Ok(Tensor::from_vec(flat, (n, 3, 1, 1), &Device::Cpu)?
            .broadcast_as((n, 3, 32, 32))?
            .contiguous()?)
    }

    fn vision_set() -> Result<vision::Dataset> {
        Ok(vision::Dataset {
            train_images: solid(&[[0.0, 0.5, 1.0], [1.0, 1.0, 1.0], [0.2, 0.2, 0.2]])?,
            train_labels: Tensor::new(&[4u8, 1, 7], &Device::Cpu)?,
            test_images: solid(&[[1.0, 0.0, 0.0], [1.0, 1.0, 0.0]])?,
            test_labels: Tensor::new(&[3u8, 9], &Device::Cpu)?,
            labels: 10,
        })
    }

    #[test]
    fn splits_keep_pixels_and_widen_labels() -> Result<()> {
        let (train, test) = Cifar10Dataset::from_vision(vision_set()?, false)?;
        assert_eq!(train.len(), 3);
        assert_eq!(test.len(), 2);

        let (x, y) = test.batch(&[1, 0], &Device::Cpu)?;
        assert_eq!(x.dims(), &[2, 3, 32, 32]);
        assert_eq!(y.dtype(), DType::U32);
        assert_eq!(y.to_vec1::<u32>()?, vec![9, 3]);
        let red = x.get(1)?.get(0)?.mean_all()?.to_scalar::<f32>()?;
        assert_eq!(red, 1.0);

        let (_, y) = train.batch(&[2], &Device::Cpu)?;
        assert_eq!(y.to_vec1::<u32>()?, vec![7]);
        Ok(())
    }

    #[test]
    fn gray_mode_replicates_luminance_on_the_test_split() -> Result<()> {
        let (train, test) = Cifar10Dataset::from_vision(vision_set()?, true)?;
        let (x, _) = test.batch(&[1], &Device::Cpu)?;
        let means: Vec<f32> = (0..3)
            .map(|c| x.get(0)?.get(c)?.mean_all()?.to_scalar::<f32>())
            .collect::<candle_core::Result<_>>()?;
        assert!((means[0] - 0.886).abs() < 1e-3);
        assert_eq!(means[0], means[1]);
        assert_eq!(means[1], means[2]);

        // training images stay in colour
        let (x, _) = train.batch(&[0], &Device::Cpu)?;
        let blue = x.get(0)?.get(2)?.mean_all()?.to_scalar::<f32>()?;
        assert_eq!(blue, 1.0);
        Ok(())
    }

    #[test]
    fn out_of_range_index_is_rejected() -> Result<()> {
        let (_, test) = Cifar10Dataset::from_vision(vision_set()?, false)?;
        assert!(test.batch(&[2], &Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Cifar10Dataset::load(&dir.path().join("absent"), false).is_err());
    }
}
