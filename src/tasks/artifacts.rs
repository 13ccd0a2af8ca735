//! On-disk layout of a run and the naming of everything written into it.
//!
//! ```text
//! <experiments_dir>/<YYYYmmdd-HHMM>_<project>/
//!     reconstructed_images/<tag>_E3S100_imgrec7_label=7_d2.jpg
//!     weights/<tag>_se_E3S0_testacc=0.4120.safetensors
//!     weights/<tag>_d2_E3S0.safetensors
//!     weights/log_<tag>.txt
//! ```

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use image::{GrayImage, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

pub const WEIGHTS_EXT: &str = "safetensors";

#[derive(Debug, Clone)]
pub struct RunLayout {
    pub project_dir: PathBuf,
    pub image_dir: PathBuf,
    pub weights_dir: PathBuf,
    pub run_tag: String,
}

impl RunLayout {
    /// Layout stamped with the current local time and host.
    pub fn create(experiments_dir: &Path, project_name: &str, resume: bool) -> Result<Self> {
        let time_id = chrono::Local::now().format("%Y%m%d-%H%M").to_string();
        Self::create_at(experiments_dir, project_name, resume, &time_id, &server_id())
    }

    /// An existing project directory is wiped unless `resume` is set.
    pub fn create_at(
        experiments_dir: &Path,
        project_name: &str,
        resume: bool,
        time_id: &str,
        server: &str,
    ) -> Result<Self> {
        let project_dir = experiments_dir.join(format!("{}_{}", time_id, project_name));
        if project_dir.exists() && !resume {
            fs::remove_dir_all(&project_dir)
                .with_context(|| format!("clear project dir {:?}", project_dir))?;
        }
        let image_dir = project_dir.join("reconstructed_images");
        let weights_dir = project_dir.join("weights");
        for dir in [&project_dir, &image_dir, &weights_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
        }
        Ok(Self {
            project_dir,
            image_dir,
            weights_dir,
            run_tag: run_tag(server, time_id),
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.weights_dir.join(format!("log_{}.txt", self.run_tag))
    }
}

/// `$SERVER`, else `$HOSTNAME`, else `local`.
pub fn server_id() -> String {
    ["SERVER", "HOSTNAME"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}

pub fn run_tag(server: &str, time_id: &str) -> String {
    format!("SERVER{}-{}", server, time_id)
}

/// `<tag>_<role><index>_E<e>S<s>[_testacc=<acc>].safetensors`
pub fn checkpoint_name(
    tag: &str,
    role: &str,
    index: Option<usize>,
    epoch: usize,
    step: usize,
    test_acc: Option<f64>,
) -> String {
    let index = index.map(|i| i.to_string()).unwrap_or_default();
    let acc = test_acc
        .map(|a| format!("_testacc={:.4}", a))
        .unwrap_or_default();
    format!(
        "{}_{}{}_E{}S{}{}.{}",
        tag, role, index, epoch, step, acc, WEIGHTS_EXT
    )
}

/// `<tag>_E<e>S<s>_imgrec<probe>_label=<label>_d<decoder>.jpg`, decoder 1-based.
pub fn image_name(
    tag: &str,
    epoch: usize,
    step: usize,
    probe: usize,
    label: u32,
    decoder: usize,
) -> String {
    format!(
        "{}_E{}S{}_imgrec{}_label={}_d{}.jpg",
        tag, epoch, step, probe, label, decoder
    )
}

/// Epoch and step from a `_`-separated clip of the form `E<digits>S<digits>`
/// (the last one wins). `(0, 0)` when there is none.
pub fn parse_resume_tag(path: &Path) -> (usize, usize) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut found = (0, 0);
    for clip in name.split('_') {
        let clip = clip.split('.').next().unwrap_or(clip);
        let Some(rest) = clip.strip_prefix('E') else {
            continue;
        };
        let Some((e, s)) = rest.split_once('S') else {
            continue;
        };
        let digits = |v: &str| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit());
        if digits(e) && digits(s) {
            if let (Ok(e), Ok(s)) = (e.parse(), s.parse()) {
                found = (e, s);
            }
        }
    }
    found
}

/// The single file in `dir` whose name contains both `_d<index>_` and `timeid`.
pub fn find_pretrained_decoder(dir: &Path, timeid: &str, index: usize) -> Result<PathBuf> {
    let needle = format!("_d{}_", index);
    let mut hits = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("list {:?}", dir))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(&needle) && name.contains(timeid) {
            hits.push(entry.path());
        }
    }
    match hits.len() {
        1 => Ok(hits.remove(0)),
        n => bail!(crate::KtError::Config(format!(
            "expected exactly one pretrained decoder {} for {:?} in {:?}, found {}",
            index, timeid, dir, n
        ))),
    }
}

/// Write a `[1, C, H, W]` or `[C, H, W]` image, clamped to `[0, 1]`, with C in {1, 3}.
pub fn save_image_tensor(img: &Tensor, path: &Path) -> crate::Result<()> {
    let img = match img.rank() {
        4 => img.squeeze(0)?,
        _ => img.clone(),
    };
    let (c, h, w) = img.dims3()?;
    let bytes = img
        .clamp(0f32, 1f32)?
        .affine(255.0, 0.0)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let (w32, h32) = (w as u32, h as u32);
    let len = bytes.len();
    let short_buffer = || crate::KtError::ShapeMismatch {
        what: "image buffer".into(),
        expected: vec![c * h * w],
        got: vec![len],
    };
    match c {
        1 => {
            GrayImage::from_raw(w32, h32, bytes)
                .ok_or_else(short_buffer)?
                .save(path)?;
        }
        3 => {
            RgbImage::from_raw(w32, h32, bytes)
                .ok_or_else(short_buffer)?
                .save(path)?;
        }
        _ => {
            return Err(crate::KtError::ShapeMismatch {
                what: "image channels".into(),
                expected: vec![3],
                got: vec![c],
            })
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn resume_tag_is_parsed_from_clips() {
        let p = Path::new("w/SERVER1-20190313-1233_se_E12S340_testacc=0.9012.safetensors");
        assert_eq!(parse_resume_tag(p), (12, 340));
        assert_eq!(parse_resume_tag(Path::new("d1_E3S0.safetensors")), (3, 0));
    }

    #[test]
    fn resume_tag_defaults_to_zero() {
        assert_eq!(parse_resume_tag(Path::new("model_best.safetensors")), (0, 0));
        assert_eq!(parse_resume_tag(Path::new("x_Ex12S3_y")), (0, 0));
        assert_eq!(parse_resume_tag(Path::new("x_E12S_y")), (0, 0));
    }

    #[test]
    fn names_follow_the_patterns() {
        let tag = run_tag("7", "20240101-0930");
        assert_eq!(tag, "SERVER7-20240101-0930");
        assert_eq!(
            checkpoint_name(&tag, "se", None, 2, 40, Some(0.51234)),
            "SERVER7-20240101-0930_se_E2S40_testacc=0.5123.safetensors"
        );
        assert_eq!(
            checkpoint_name(&tag, "d", Some(3), 2, 40, None),
            "SERVER7-20240101-0930_d3_E2S40.safetensors"
        );
        assert_eq!(
            image_name(&tag, 0, 100, 4, 4, 1),
            "SERVER7-20240101-0930_E0S100_imgrec4_label=4_d1.jpg"
        );
    }

    #[test]
    fn layout_wipes_unless_resuming() -> Result<()> {
        let root = tempfile::tempdir()?;
        let a = RunLayout::create_at(root.path(), "p", false, "20240101-0000", "x")?;
        fs::write(a.weights_dir.join("old.txt"), "x")?;
        RunLayout::create_at(root.path(), "p", true, "20240101-0000", "x")?;
        assert!(a.weights_dir.join("old.txt").exists());
        let b = RunLayout::create_at(root.path(), "p", false, "20240101-0000", "x")?;
        assert!(!b.weights_dir.join("old.txt").exists());
        assert!(b.image_dir.is_dir());
        assert_eq!(b.log_path().file_name().unwrap(), "log_SERVERx-20240101-0000.txt");
        Ok(())
    }

    #[test]
    fn pretrained_lookup_needs_one_match() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["A-1_d1_E0S0.safetensors", "A-1_d2_E0S0.safetensors", "B-2_d1_E0S0.safetensors"] {
            fs::write(dir.path().join(name), b"")?;
        }
        let hit = find_pretrained_decoder(dir.path(), "A-1", 2)?;
        assert!(hit.ends_with("A-1_d2_E0S0.safetensors"));
        assert!(find_pretrained_decoder(dir.path(), "A-1", 3).is_err());
        assert!(find_pretrained_decoder(dir.path(), "_E0S0", 1).is_err());
        Ok(())
    }

    #[test]
    fn writes_a_jpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("x.jpg");
        let img = Tensor::rand(-1f32, 2.0, (1, 3, 8, 8), &Device::Cpu)?;
        save_image_tensor(&img, &path)?;
        let back = image::open(&path)?;
        assert_eq!((back.width(), back.height()), (8, 8));
        Ok(())
    }

    #[test]
    fn pixels_land_row_major() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // 2 rows x 3 columns; red rises along x, green marks the second row
        let red = [[0f32, 0.5, 1.0], [0.0, 0.5, 1.0]];
        let green = [[0f32, 0.0, 0.0], [1.0, 1.0, 1.0]];
        let blue = [[0f32; 3]; 2];
        let rgb = Tensor::new(&[red, green, blue], &Device::Cpu)?;
        let path = dir.path().join("rgb.png");
        save_image_tensor(&rgb, &path)?;
        let back = image::open(&path)?.to_rgb8();
        assert_eq!((back.width(), back.height()), (3, 2));
        assert_eq!(back.get_pixel(2, 0).0, [255, 0, 0]);
        assert_eq!(back.get_pixel(1, 1).0, [128, 255, 0]);

        let gray = Tensor::new(&[red], &Device::Cpu)?;
        let path = dir.path().join("gray.png");
        save_image_tensor(&gray, &path)?;
        let back = image::open(&path)?.to_luma8();
        assert_eq!(back.get_pixel(2, 1).0, [255]);
        assert_eq!(back.get_pixel(0, 1).0, [0]);
        Ok(())
    }
}
