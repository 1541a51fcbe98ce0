//! Preview rendering for reconstructed image series.
//!
//! A series is grouped into slices by location and into timepoints by instance number.
//! Three artifacts are written: an animation of the middle slice, a single-frame
//! thumbnail and a montage of every slice.

use crate::dicom::{read_dicom, DicomError, DicomImage};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, ImageFormat, Rgba, RgbaImage};
use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ANIMATION_FILE: &str = "animation.gif";
pub const THUMBNAIL_FILE: &str = "thumbnail.gif";
pub const MONTAGE_FILE: &str = "montage.gif";

const DERIVED_IMAGE_EXTENSION: &str = "dcm";
const SLICE_TOLERANCE: f64 = 1e-3;
const LOW_PERCENTILE: f64 = 0.01;
const HIGH_PERCENTILE: f64 = 0.99;

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("I/O error while building preview: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode {path}: {source}")]
    Dicom {
        path: PathBuf,
        #[source]
        source: DicomError,
    },

    #[error("No derived images found in {0}")]
    Empty(PathBuf),

    #[error("Failed to encode preview: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Preview task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colormap {
    #[default]
    Gray,
    Hot,
}

impl Colormap {
    /// Map a normalized intensity in `0..=1` to a color.
    pub fn apply(&self, v: f32) -> Rgba<u8> {
        let byte = |x: f32| (x.clamp(0.0, 1.0) * 255.0).round() as u8;
        match self {
            Colormap::Gray => {
                let g = byte(v);
                Rgba([g, g, g, 255])
            }
            Colormap::Hot => Rgba([
                byte(v * 3.0),
                byte(v * 3.0 - 1.0),
                byte(v * 3.0 - 2.0),
                255,
            ]),
        }
    }
}

impl fmt::Display for Colormap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Colormap::Gray => write!(f, "gray"),
            Colormap::Hot => write!(f, "hot"),
        }
    }
}

impl FromStr for Colormap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gray" | "grey" => Ok(Colormap::Gray),
            "hot" => Ok(Colormap::Hot),
            other => Err(format!("Unknown colormap: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreviewOptions {
    /// Frames-per-second baseline used to derive the animation length.
    pub fps: u32,
    pub colormap: Colormap,
    /// Overrides the derived animation length.
    pub total_duration: Option<Duration>,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            fps: 30,
            colormap: Colormap::Gray,
            total_duration: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewArtifacts {
    pub animation: PathBuf,
    pub thumbnail: PathBuf,
    pub montage: PathBuf,
    pub series_instance_uid: Option<String>,
    pub frame_count: usize,
    pub slice_count: usize,
    pub image_count: usize,
}

#[derive(Debug, Clone)]
pub struct Slice {
    pub location: Option<f64>,
    /// Timepoints in acquisition order.
    pub frames: Vec<DicomImage>,
}

#[derive(Debug, Clone)]
pub struct ImageSeries {
    /// Slices ordered by location.
    pub slices: Vec<Slice>,
}

fn same_location(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() < SLICE_TOLERANCE,
        (None, None) => true,
        _ => false,
    }
}

fn cmp_option<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

impl ImageSeries {
    pub fn from_images(images: Vec<DicomImage>) -> Self {
        let mut slices: Vec<Slice> = Vec::new();
        for image in images {
            match slices
                .iter_mut()
                .find(|s| same_location(s.location, image.slice_location))
            {
                Some(slice) => slice.frames.push(image),
                None => slices.push(Slice {
                    location: image.slice_location,
                    frames: vec![image],
                }),
            }
        }

        slices.sort_by(|a, b| cmp_option(a.location, b.location));
        for slice in &mut slices {
            slice.frames.sort_by(|a, b| {
                cmp_option(a.instance_number, b.instance_number)
                    .then_with(|| cmp_option(a.echo_time, b.echo_time))
            });
        }
        Self { slices }
    }

    pub fn image_count(&self) -> usize {
        self.slices.iter().map(|s| s.frames.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.image_count() == 0
    }

    pub fn middle_slice(&self) -> Option<&Slice> {
        self.slices.get(self.slices.len() / 2)
    }

    /// First series identifier found in the series.
    pub fn series_instance_uid(&self) -> Option<String> {
        self.slices
            .iter()
            .flat_map(|s| s.frames.iter())
            .find_map(|f| f.series_instance_uid.clone())
    }

    fn pixels(&self) -> impl Iterator<Item = f32> + '_ {
        self.slices
            .iter()
            .flat_map(|s| s.frames.iter())
            .flat_map(|f| f.pixels.iter().copied())
    }
}

/// Decode every derived image below `dir`, descending into subdirectories.
pub async fn load_series(dir: &Path) -> Result<ImageSeries, PreviewError> {
    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(DERIVED_IMAGE_EXTENSION))
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            let image = read_dicom(&path)
                .await
                .map_err(|source| PreviewError::Dicom {
                    path: path.clone(),
                    source,
                })?;
            images.push(image);
        }
    }

    tracing::debug!(dir = %dir.display(), count = images.len(), "Loaded derived images");
    Ok(ImageSeries::from_images(images))
}

/// Intensities at the 1st and 99th percentile of `values`.
///
/// Indices are `round(n * 0.01)` and `round(n * 0.99)` into the sorted values, clamped
/// to the last element. Returns `None` for empty input.
pub fn percentile_bounds(values: &[f32]) -> Option<(f32, f32)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let index = |p: f64| ((n as f64 * p).round() as usize).min(n - 1);
    Some((sorted[index(LOW_PERCENTILE)], sorted[index(HIGH_PERCENTILE)]))
}

/// Scale `v` into `0..=1` relative to the bounds, clipping anything outside.
pub fn normalize(v: f32, low: f32, high: f32) -> f32 {
    if high <= low {
        return if v > low { 1.0 } else { 0.0 };
    }
    ((v - low) / (high - low)).clamp(0.0, 1.0)
}

fn render(image: &DicomImage, bounds: (f32, f32), colormap: Colormap) -> RgbaImage {
    let (low, high) = bounds;
    RgbaImage::from_fn(image.columns, image.rows, |x, y| {
        let v = image.pixels[(y * image.columns + x) as usize];
        colormap.apply(normalize(v, low, high))
    })
}

fn montage(tiles: &[RgbaImage]) -> RgbaImage {
    let columns = (tiles.len() as f64).sqrt().ceil().max(1.0) as u32;
    let rows = (tiles.len() as u32).div_ceil(columns);
    let cell_w = tiles.iter().map(|t| t.width()).max().unwrap_or(1);
    let cell_h = tiles.iter().map(|t| t.height()).max().unwrap_or(1);

    let mut canvas = RgbaImage::from_pixel(columns * cell_w, rows * cell_h, Rgba([0, 0, 0, 255]));
    for (i, tile) in tiles.iter().enumerate() {
        let i = i as u32;
        let x = (i % columns) * cell_w;
        let y = (i / columns) * cell_h;
        image::imageops::overlay(&mut canvas, tile, x as i64, y as i64);
    }
    canvas
}

fn frame_delay(series: &ImageSeries, frames: usize, options: &PreviewOptions) -> Delay {
    let total = options.total_duration.unwrap_or_else(|| {
        Duration::from_secs_f64(series.image_count() as f64 / options.fps.max(1) as f64)
    });
    Delay::from_saturating_duration(total / frames.max(1) as u32)
}

fn write_artifacts(
    series: ImageSeries,
    out_dir: PathBuf,
    options: PreviewOptions,
) -> Result<PreviewArtifacts, PreviewError> {
    let bounds = percentile_bounds(&series.pixels().collect::<Vec<_>>())
        .ok_or_else(|| PreviewError::Empty(out_dir.clone()))?;
    let middle = series
        .middle_slice()
        .ok_or_else(|| PreviewError::Empty(out_dir.clone()))?;

    std::fs::create_dir_all(&out_dir)?;
    let animation = out_dir.join(ANIMATION_FILE);
    let thumbnail = out_dir.join(THUMBNAIL_FILE);
    let montage_path = out_dir.join(MONTAGE_FILE);

    let delay = frame_delay(&series, middle.frames.len(), &options);
    {
        let file = io::BufWriter::new(std::fs::File::create(&animation)?);
        let mut encoder = GifEncoder::new(file);
        encoder.set_repeat(Repeat::Infinite)?;
        for image in &middle.frames {
            let frame = Frame::from_parts(render(image, bounds, options.colormap), 0, 0, delay);
            encoder.encode_frame(frame)?;
        }
    }

    let first = &middle.frames[0];
    DynamicImage::ImageRgba8(render(first, bounds, options.colormap))
        .save_with_format(&thumbnail, ImageFormat::Gif)?;

    let tiles: Vec<RgbaImage> = series
        .slices
        .iter()
        .filter_map(|s| s.frames.first())
        .map(|f| render(f, bounds, options.colormap))
        .collect();
    DynamicImage::ImageRgba8(montage(&tiles)).save_with_format(&montage_path, ImageFormat::Gif)?;

    Ok(PreviewArtifacts {
        animation,
        thumbnail,
        montage: montage_path,
        series_instance_uid: series.series_instance_uid(),
        frame_count: middle.frames.len(),
        slice_count: series.slices.len(),
        image_count: series.image_count(),
    })
}

/// Build the preview artifacts for the derived images below `series_dir` into `out_dir`.
pub async fn build_preview(
    series_dir: &Path,
    out_dir: &Path,
    options: &PreviewOptions,
) -> Result<PreviewArtifacts, PreviewError> {
    let start = std::time::Instant::now();
    let series = load_series(series_dir).await?;
    if series.is_empty() {
        return Err(PreviewError::Empty(series_dir.to_path_buf()));
    }

    let out = out_dir.to_path_buf();
    let opts = options.clone();
    let artifacts = tokio::task::spawn_blocking(move || write_artifacts(series, out, opts))
        .await
        .map_err(|e| PreviewError::Task(e.to_string()))??;

    tracing::info!(
        out_dir = %out_dir.display(),
        frames = artifacts.frame_count,
        slices = artifacts.slice_count,
        duration_ms = start.elapsed().as_millis(),
        "Preview built"
    );
    Ok(artifacts)
}
