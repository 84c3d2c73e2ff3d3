use anyhow::{Context, Result};
use image::{ColorType, DynamicImage, ExtendedColorType, ImageDecoder, ImageFormat, ImageReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    /// Not an image, truncated, or an unsupported format.
    Undecodable(String),
    Undersized { width: u32, height: u32 },
    /// Conversion to RGB succeeded but the result could not be written back.
    Unwritable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeOutcome {
    Kept,
    /// Rewritten as RGB8, in `format` (PNG when the source format cannot hold RGB8).
    Converted { from: ExtendedColorType, format: ImageFormat },
    Removed(Removal),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub scanned: usize,
    pub kept: usize,
    pub converted: usize,
    pub removed: Vec<(PathBuf, Removal)>,
}

/// Destructive cleanup of an acquisition tree. Removals are permanent.
#[derive(Debug, Clone)]
pub struct ImageSanitizer {
    min_dimension: u32,
}

impl Default for ImageSanitizer {
    fn default() -> Self { Self { min_dimension: 50 } }
}

impl ImageSanitizer {
    pub fn new(min_dimension: u32) -> Self { Self { min_dimension } }

    /// Sanitize every file under `root` on the blocking pool. A missing root is an empty pass.
    pub async fn sanitize(&self, root: &Path) -> Result<SanitizeReport> {
        let this = self.clone();
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || this.sanitize_tree(&root))
            .await
            .context("sanitizer task failed")
    }

    pub fn sanitize_tree(&self, root: &Path) -> SanitizeReport {
        let mut report = SanitizeReport::default();
        let files = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file());
        for entry in files {
            report.scanned += 1;
            match self.sanitize_file(entry.path()) {
                SanitizeOutcome::Kept => report.kept += 1,
                SanitizeOutcome::Converted { .. } => report.converted += 1,
                SanitizeOutcome::Removed(reason) => report.removed.push((entry.path().to_path_buf(), reason)),
            }
        }
        info!(
            root = %root.display(),
            scanned = report.scanned,
            kept = report.kept,
            converted = report.converted,
            removed = report.removed.len(),
            "sanitization finished"
        );
        report
    }

    pub fn sanitize_file(&self, path: &Path) -> SanitizeOutcome {
        let decoded = match decode(path) {
            Ok(decoded) => decoded,
            Err(e) => return remove(path, Removal::Undecodable(format!("{e:#}"))),
        };
        let (width, height) = (decoded.image.width(), decoded.image.height());
        if width < self.min_dimension || height < self.min_dimension {
            return remove(path, Removal::Undersized { width, height });
        }
        if !needs_rgb_conversion(decoded.original, decoded.image.color()) {
            return SanitizeOutcome::Kept;
        }
        let format = rgb_target(decoded.format);
        let rgb = DynamicImage::ImageRgb8(decoded.image.to_rgb8());
        match rgb.save_with_format(path, format) {
            Ok(()) => {
                debug!(path = %path.display(), from = ?decoded.original, ?format, "converted to RGB");
                SanitizeOutcome::Converted { from: decoded.original, format }
            }
            Err(e) => remove(path, Removal::Unwritable(e.to_string())),
        }
    }
}

struct Decoded {
    image: DynamicImage,
    format: ImageFormat,
    /// Color layout as stored in the file. JPEG decoding turns CMYK into RGB, so
    /// `image.color()` alone can hide a 4-channel file.
    original: ExtendedColorType,
}

/// Decode by content sniffing; the extension is not trusted.
fn decode(path: &Path) -> Result<Decoded> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    let format = reader.format().context("unrecognized image format")?;
    let decoder = reader.into_decoder()?;
    let original = decoder.original_color_type();
    let image = DynamicImage::from_decoder(decoder)?;
    Ok(Decoded { image, format, original })
}

fn needs_rgb_conversion(original: ExtendedColorType, decoded: ColorType) -> bool {
    original != ExtendedColorType::Rgb8 || decoded != ColorType::Rgb8
}

/// Format to write an RGB8 image back in. GIF (and anything else whose encoder or
/// decoder does not round-trip 3-channel data) becomes PNG.
fn rgb_target(detected: ImageFormat) -> ImageFormat {
    match detected {
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp | ImageFormat::Tiff => detected,
        _ => ImageFormat::Png,
    }
}

fn remove(path: &Path, reason: Removal) -> SanitizeOutcome {
    match std::fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), ?reason, "deleted"),
        Err(e) => warn!(path = %path.display(), ?reason, error = %e, "could not delete"),
    }
    SanitizeOutcome::Removed(reason)
}
