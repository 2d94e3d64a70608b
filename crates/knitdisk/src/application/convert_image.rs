//! Use case: convert a raster image into a knitting pattern file.
//!
//! # How the conversion works (for beginners)
//!
//! 1. Decode the image (PNG, JPEG, GIF or BMP) and convert it to 8-bit
//!    greyscale ("luma").
//! 2. Resample it so it is exactly `machine_width` stitches wide.  The height
//!    keeps the source aspect ratio and is then multiplied by `scale`,
//!    because knitted stitches are wider than they are tall.
//! 3. Threshold every pixel: dark pixels (luma < 128) become "on" stitches
//!    knitted in the contrast yarn, light pixels become background.
//! 4. Serialize the resulting [`PatternGrid`] into a [`PatternFile`] and write
//!    it atomically into the output directory.
//!
//! The same image and settings always produce byte-identical output.

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::DynamicImage;
use knit_core::domain::grid::{GridError, PatternGrid, MAX_NEEDLES};
use knit_core::domain::pattern_file::{PatternFile, PATTERN_EXTENSION};
use knit_core::domain::track::MAX_BCD3;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Luma values below this become "on" stitches.
pub const LUMA_THRESHOLD: u8 = 128;

/// Longest file stem kept from the image name.
const MAX_STEM_LEN: usize = 64;

/// Stem used when the image name has no usable characters.
const FALLBACK_STEM: &str = "pattern";

/// Errors produced by [`convert_image`].
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The scale factor is zero, negative, NaN or infinite.
    #[error("scale factor must be a positive finite number, got {0}")]
    InvalidScale(f64),

    /// The requested grid width is zero or wider than the machine bed.
    #[error("machine width must be between 1 and {MAX_NEEDLES} stitches, got {0}")]
    InvalidWidth(u16),

    /// The image file could not be read.
    #[error("cannot read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bytes are not a decodable image (including an empty file).
    #[error("cannot decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The decoded image has no pixels.
    #[error("image has degenerate dimensions {width}x{height}")]
    Degenerate { width: u32, height: u32 },

    /// The scaled image needs more rows than the machine can count.
    #[error("pattern would be {rows} rows tall; the machine accepts at most {max}")]
    TooTall { rows: u32, max: u32 },

    /// The resampled grid could not be built.
    #[error("cannot build pattern grid: {0}")]
    Grid(#[from] GridError),

    /// The pattern file could not be written.
    #[error("cannot write pattern file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Tunable inputs of a conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionSettings {
    /// Vertical stretch applied to the aspect-preserving row count.
    pub scale: f64,
    /// Stitches per row.
    pub machine_width: u16,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            scale: 1.5,
            machine_width: 60,
        }
    }
}

impl ConversionSettings {
    /// Checks the settings before any file is touched.
    ///
    /// # Errors
    ///
    /// Returns [`ConversionError::InvalidScale`] or
    /// [`ConversionError::InvalidWidth`].
    pub fn validate(&self) -> Result<(), ConversionError> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(ConversionError::InvalidScale(self.scale));
        }
        if self.machine_width == 0 || self.machine_width > MAX_NEEDLES {
            return Err(ConversionError::InvalidWidth(self.machine_width));
        }
        Ok(())
    }
}

/// The result of a successful conversion.
#[derive(Debug, Clone)]
pub struct ConvertedPattern {
    /// Where the pattern file was written.
    pub path: PathBuf,
    /// The stitch grid.
    pub grid: PatternGrid,
    /// The file as written.
    pub file: PatternFile,
}

/// Converts the image at `image_path` and writes `<stem>.pat` into
/// `output_dir`, creating the directory if needed.
///
/// This is blocking file and CPU work; async callers should run it on
/// `tokio::task::spawn_blocking`.
///
/// # Errors
///
/// Returns [`ConversionError`] for invalid settings, unreadable or
/// undecodable images, degenerate dimensions and write failures.  Nothing is
/// written unless conversion succeeds.
pub fn convert_image(
    image_path: &Path,
    output_dir: &Path,
    settings: &ConversionSettings,
) -> Result<ConvertedPattern, ConversionError> {
    settings.validate()?;
    info!(
        image = %image_path.display(),
        scale = settings.scale,
        width = settings.machine_width,
        "converting image"
    );

    let bytes = std::fs::read(image_path).map_err(|source| ConversionError::Read {
        path: image_path.to_path_buf(),
        source,
    })?;
    let img = image::load_from_memory(&bytes).map_err(|source| ConversionError::Decode {
        path: image_path.to_path_buf(),
        source,
    })?;

    let grid = grid_from_image(&img, settings)?;
    let file = PatternFile::from_grid(&grid);
    let path = output_dir.join(output_file_name(image_path));
    write_atomically(&path, &file.encode())?;

    info!(
        path = %path.display(),
        width = grid.width(),
        height = grid.height(),
        on = grid.count_on(),
        "pattern written"
    );
    Ok(ConvertedPattern { path, grid, file })
}

/// Resamples and thresholds a decoded image into a grid.
///
/// # Errors
///
/// Returns [`ConversionError`] for invalid settings, an image without
/// pixels, or one that would scale past the machine's row limit.
pub fn grid_from_image(
    img: &DynamicImage,
    settings: &ConversionSettings,
) -> Result<PatternGrid, ConversionError> {
    settings.validate()?;
    let (src_w, src_h) = (img.width(), img.height());
    if src_w == 0 || src_h == 0 {
        return Err(ConversionError::Degenerate {
            width: src_w,
            height: src_h,
        });
    }

    let width = settings.machine_width;
    let height = target_height(src_w, src_h, width, settings.scale);
    if height > MAX_BCD3 {
        return Err(ConversionError::TooTall {
            rows: height,
            max: MAX_BCD3,
        });
    }
    debug!(src_w, src_h, width, height, "resampling image");

    let luma = img.to_luma8();
    let resized = imageops::resize(&luma, u32::from(width), height, FilterType::Triangle);
    let cells = resized
        .pixels()
        .map(|p| p.0[0] < LUMA_THRESHOLD)
        .collect();
    Ok(PatternGrid::from_cells(width, height, cells)?)
}

/// Row count for a `width`-stitch grid: `max(1, round(h * width / w * scale))`.
pub fn target_height(src_w: u32, src_h: u32, width: u16, scale: f64) -> u32 {
    let rows = f64::from(src_h) * f64::from(width) / f64::from(src_w) * scale;
    rows.round().clamp(1.0, f64::from(u32::MAX)) as u32
}

/// `<sanitized stem>.pat` for `image_path`.
///
/// Characters outside `[A-Za-z0-9_-]` become `_`; the stem is cut to 64
/// characters and replaced by `pattern` when empty.
pub fn output_file_name(image_path: &Path) -> String {
    let stem: String = image_path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .take(MAX_STEM_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if stem.is_empty() { FALLBACK_STEM } else { &stem };
    format!("{stem}.{PATTERN_EXTENSION}")
}

/// Writes to a hidden sibling and renames it over `path`.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ConversionError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| ConversionError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    std::fs::write(&tmp, contents).map_err(|source| ConversionError::Write {
        path: tmp.clone(),
        source,
    })?;
    if let Err(source) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(ConversionError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    debug!(path = %path.display(), bytes = contents.len(), "renamed pattern into place");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn solid(width: u32, height: u32, luma: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([luma])))
    }

    fn write_png(dir: &Path, name: &str, img: &DynamicImage) -> PathBuf {
        let path = dir.join(name);
        img.save(&path).expect("save test image");
        path
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    #[test]
    fn test_default_settings_are_valid() {
        let settings = ConversionSettings::default();
        assert_eq!(settings.scale, 1.5);
        assert_eq!(settings.machine_width, 60);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_non_positive_or_non_finite_scale_is_rejected() {
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let settings = ConversionSettings { scale, machine_width: 60 };
            assert!(
                matches!(settings.validate(), Err(ConversionError::InvalidScale(_))),
                "scale {scale} accepted"
            );
        }
    }

    #[test]
    fn test_width_outside_machine_range_is_rejected() {
        for width in [0, MAX_NEEDLES + 1] {
            let settings = ConversionSettings { scale: 1.0, machine_width: width };
            assert!(matches!(
                settings.validate(),
                Err(ConversionError::InvalidWidth(w)) if w == width
            ));
        }
    }

    // ── Grid computation ──────────────────────────────────────────────────────

    #[test]
    fn test_solid_black_square_gives_full_60x90_grid() {
        // Arrange
        let img = solid(100, 100, 0);

        // Act
        let grid = grid_from_image(&img, &ConversionSettings::default()).unwrap();

        // Assert
        assert_eq!(grid.width(), 60);
        assert_eq!(grid.height(), 90);
        assert_eq!(grid.count_on(), 60 * 90);
    }

    #[test]
    fn test_solid_white_image_gives_empty_grid() {
        let grid = grid_from_image(&solid(40, 20, 255), &ConversionSettings::default()).unwrap();
        assert_eq!(grid.count_on(), 0);
    }

    #[test]
    fn test_left_half_dark_maps_to_left_half_stitches() {
        // Arrange: 80x40, left half black, right half white.
        let mut gray = GrayImage::from_pixel(80, 40, Luma([255]));
        for y in 0..40 {
            for x in 0..40 {
                gray.put_pixel(x, y, Luma([0]));
            }
        }
        let settings = ConversionSettings { scale: 1.0, machine_width: 20 };

        // Act
        let grid = grid_from_image(&DynamicImage::ImageLuma8(gray), &settings).unwrap();

        // Assert: away from the seam the halves are clean.
        assert_eq!(grid.height(), 10);
        for y in 0..grid.height() {
            assert_eq!(grid.get(2, y), Some(true));
            assert_eq!(grid.get(17, y), Some(false));
        }
    }

    #[test]
    fn test_target_height_never_drops_below_one_row() {
        assert_eq!(target_height(1000, 1, 10, 0.01), 1);
    }

    #[test]
    fn test_target_height_rounds_to_nearest() {
        // 30 * 60 / 100 * 1.5 = 27.0
        assert_eq!(target_height(100, 30, 60, 1.5), 27);
        // 10 * 60 / 70 * 1.0 = 8.57 → 9
        assert_eq!(target_height(70, 10, 60, 1.0), 9);
    }

    #[test]
    fn test_empty_image_is_degenerate() {
        let img = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(matches!(
            grid_from_image(&img, &ConversionSettings::default()),
            Err(ConversionError::Degenerate { .. })
        ));
    }

    #[test]
    fn test_tall_thin_image_is_rejected_before_resampling() {
        // Arrange: 10000 * 200 / 1 * 2.0 = 4,000,000 rows.
        let img = DynamicImage::ImageLuma8(GrayImage::new(1, 10_000));
        let settings = ConversionSettings {
            scale: 2.0,
            machine_width: 200,
        };

        // Act
        let result = grid_from_image(&img, &settings);

        // Assert
        assert!(matches!(
            result,
            Err(ConversionError::TooTall { rows: 4_000_000, max: 999 })
        ));
    }

    #[test]
    fn test_image_reaching_row_limit_exactly_converts() {
        // 333 * 2 / 2 * 3.0 = 999
        let img = DynamicImage::ImageLuma8(GrayImage::new(2, 333));
        let settings = ConversionSettings {
            scale: 3.0,
            machine_width: 2,
        };
        let grid = grid_from_image(&img, &settings).unwrap();
        assert_eq!(grid.height(), 999);
    }

    // ── Output naming ─────────────────────────────────────────────────────────

    #[test]
    fn test_output_name_keeps_safe_characters() {
        assert_eq!(output_file_name(Path::new("/up/my-heart_2.png")), "my-heart_2.pat");
    }

    #[test]
    fn test_output_name_replaces_unsafe_characters() {
        assert_eq!(
            output_file_name(Path::new("a b;rm -rf $(x).jpg")),
            "a_b_rm_-rf___x_.pat"
        );
    }

    #[test]
    fn test_output_name_truncates_long_stems() {
        let long = "x".repeat(100) + ".png";
        let name = output_file_name(Path::new(&long));
        assert_eq!(name, "x".repeat(64) + ".pat");
    }

    #[test]
    fn test_output_name_falls_back_when_stem_missing() {
        assert_eq!(output_file_name(Path::new("/")), "pattern.pat");
    }

    // ── End to end ────────────────────────────────────────────────────────────

    #[test]
    fn test_convert_image_writes_decodable_pattern_file() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let image = write_png(dir.path(), "black.png", &solid(100, 100, 0));
        let out = dir.path().join("out");

        // Act
        let converted = convert_image(&image, &out, &ConversionSettings::default()).unwrap();

        // Assert
        assert_eq!(converted.path, out.join("black.pat"));
        let bytes = std::fs::read(&converted.path).unwrap();
        let decoded = PatternFile::decode(&bytes).unwrap();
        assert_eq!(decoded, converted.file);
        assert_eq!(decoded.to_grid().unwrap(), converted.grid);
        assert_eq!(converted.grid.count_on(), 60 * 90);
    }

    #[test]
    fn test_convert_image_is_deterministic() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let mut gray = GrayImage::new(37, 23);
        for (x, y, p) in gray.enumerate_pixels_mut() {
            *p = Luma([((x * 7 + y * 13) % 256) as u8]);
        }
        let image = write_png(dir.path(), "noise.png", &DynamicImage::ImageLuma8(gray));

        // Act
        let first = convert_image(&image, &dir.path().join("a"), &ConversionSettings::default()).unwrap();
        let second = convert_image(&image, &dir.path().join("b"), &ConversionSettings::default()).unwrap();

        // Assert
        assert_eq!(
            std::fs::read(first.path).unwrap(),
            std::fs::read(second.path).unwrap()
        );
    }

    #[test]
    fn test_zero_byte_file_is_a_decode_error_and_writes_nothing() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("empty.png");
        std::fs::write(&image, b"").unwrap();
        let out = dir.path().join("out");

        // Act
        let result = convert_image(&image, &out, &ConversionSettings::default());

        // Assert
        assert!(matches!(result, Err(ConversionError::Decode { .. })));
        assert!(!out.exists());
    }

    #[test]
    fn test_missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = convert_image(
            &dir.path().join("nope.png"),
            dir.path(),
            &ConversionSettings::default(),
        );
        assert!(matches!(result, Err(ConversionError::Read { .. })));
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_png(dir.path(), "dot.png", &solid(4, 4, 0));
        let out = dir.path().join("out");

        convert_image(&image, &out, &ConversionSettings::default()).unwrap();

        let names: Vec<String> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["dot.pat"]);
    }
}
