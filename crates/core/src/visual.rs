//! Visual baseline comparison for screenshot artifacts

use std::path::{Path, PathBuf};

use image::{GenericImageView, Pixel, RgbaImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Per-channel difference tolerated as anti-aliasing noise
const TOLERANCE: i32 = 5;

/// Result of a visual comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualDiff {
    /// Artifact file name the baseline is keyed by
    pub name: String,

    /// Whether the images match (within threshold)
    pub matches: bool,

    /// Percentage of pixels that differ
    pub diff_percent: f64,

    pub diff_pixels: u64,

    pub total_pixels: u64,

    /// Highlighted diff image, written when any pixel differs
    pub diff_image_path: Option<PathBuf>,

    pub actual_hash: String,

    pub baseline_hash: String,
}

/// Configuration for visual testing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    pub baseline_dir: PathBuf,
    pub diff_dir: PathBuf,
    /// Allowed share of differing pixels (0.0 - 100.0)
    pub threshold_percent: f64,
    /// Write missing baselines from the current screenshots
    pub update_baselines: bool,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            baseline_dir: PathBuf::from("baselines"),
            diff_dir: PathBuf::from("test-results/diffs"),
            threshold_percent: 0.5,
            update_baselines: false,
        }
    }
}

/// Compares screenshots against `<baseline_dir>/<file name>`
#[derive(Debug, Clone)]
pub struct VisualComparator {
    config: VisualConfig,
}

impl VisualComparator {
    pub fn new(config: VisualConfig) -> HarnessResult<Self> {
        if !(0.0..=100.0).contains(&config.threshold_percent) {
            return Err(HarnessError::Config(format!(
                "visual threshold {} is outside 0-100",
                config.threshold_percent
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &VisualConfig {
        &self.config
    }

    /// Compare one screenshot with its baseline.
    ///
    /// Returns `None` when no baseline exists and updating is off.
    pub fn compare(&self, actual_path: &Path) -> HarnessResult<Option<VisualDiff>> {
        let name = actual_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                HarnessError::Visual(format!("not a file: {}", actual_path.display()))
            })?;
        let baseline_path = self.config.baseline_dir.join(&name);

        if !actual_path.exists() {
            return Err(HarnessError::Visual(format!(
                "screenshot not found: {}",
                actual_path.display()
            )));
        }

        if !baseline_path.exists() {
            if !self.config.update_baselines {
                info!(
                    "No baseline for '{}' - rerun with --update-baselines to create it",
                    name
                );
                return Ok(None);
            }
            std::fs::create_dir_all(&self.config.baseline_dir)?;
            std::fs::copy(actual_path, &baseline_path)?;
            info!("Created baseline {}", baseline_path.display());

            let hash = hash_file(actual_path)?;
            return Ok(Some(VisualDiff {
                name,
                matches: true,
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: 0,
                diff_image_path: None,
                actual_hash: hash.clone(),
                baseline_hash: hash,
            }));
        }

        let actual_hash = hash_file(actual_path)?;
        let baseline_hash = hash_file(&baseline_path)?;
        let actual_img = image::open(actual_path)?;

        if actual_hash == baseline_hash {
            debug!("'{}' matches its baseline byte for byte", name);
            return Ok(Some(VisualDiff {
                name,
                matches: true,
                diff_percent: 0.0,
                diff_pixels: 0,
                total_pixels: u64::from(actual_img.width()) * u64::from(actual_img.height()),
                diff_image_path: None,
                actual_hash,
                baseline_hash,
            }));
        }

        let baseline_img = image::open(&baseline_path)?;
        if actual_img.dimensions() != baseline_img.dimensions() {
            warn!(
                "Screenshot dimensions differ for '{}': actual {:?} vs baseline {:?}",
                name,
                actual_img.dimensions(),
                baseline_img.dimensions()
            );
        }

        let actual = actual_img.to_rgba8();
        let baseline = baseline_img.to_rgba8();
        let width = actual.width().max(baseline.width());
        let height = actual.height().max(baseline.height());

        let mut diff_img = RgbaImage::new(width, height);
        let mut diff_pixels = 0u64;
        let total_pixels = u64::from(width) * u64::from(height);

        for y in 0..height {
            for x in 0..width {
                let a = pixel_at(&actual, x, y);
                let b = pixel_at(&baseline, x, y);
                match (a, b) {
                    (Some(a), Some(b)) if !pixels_differ(a, b) => {
                        let c = a.channels();
                        diff_img.put_pixel(x, y, image::Rgba([c[0] / 2, c[1] / 2, c[2] / 2, 128]));
                    }
                    _ => {
                        // Outside the overlap counts as different
                        diff_pixels += 1;
                        diff_img.put_pixel(x, y, image::Rgba([255, 0, 0, 255]));
                    }
                }
            }
        }

        let diff_percent = if total_pixels == 0 {
            0.0
        } else {
            diff_pixels as f64 / total_pixels as f64 * 100.0
        };
        let matches = diff_percent <= self.config.threshold_percent;

        let diff_image_path = if diff_pixels > 0 {
            std::fs::create_dir_all(&self.config.diff_dir)?;
            let stem = actual_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| name.clone());
            let path = self.config.diff_dir.join(format!("{}-diff.png", stem));
            diff_img.save(&path)?;
            Some(path)
        } else {
            None
        };

        if !matches {
            warn!(
                "Visual regression in '{}': {:.2}% pixels differ (threshold: {:.2}%)",
                name, diff_percent, self.config.threshold_percent
            );
        }

        Ok(Some(VisualDiff {
            name,
            matches,
            diff_percent,
            diff_pixels,
            total_pixels,
            diff_image_path,
            actual_hash,
            baseline_hash,
        }))
    }
}

fn pixel_at(img: &RgbaImage, x: u32, y: u32) -> Option<&image::Rgba<u8>> {
    (x < img.width() && y < img.height()).then(|| img.get_pixel(x, y))
}

fn pixels_differ(a: &image::Rgba<u8>, b: &image::Rgba<u8>) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| (i32::from(*x) - i32::from(*y)).abs() > TOLERANCE)
}

/// Hex SHA-256 of a file's contents
pub fn hash_file(path: &Path) -> HarnessResult<String> {
    let data = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&data)))
}
