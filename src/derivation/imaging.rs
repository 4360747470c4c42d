//! Thumbnail and tile derivation for full-page capture screenshots.
//!
//! Sources are very tall rasters, so decoding runs with the codec's
//! allocation limits lifted. Everything here is synchronous and CPU-bound;
//! async callers should run it on a blocking thread.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageFormat, ImageReader};
use thiserror::Error;
use tracing::debug;

use crate::fs_utils::reset_dir;

/// Height in pixels of every tile except possibly the last.
pub const TILE_HEIGHT: u32 = 1024;

/// Thumbnails are cut from at most this many rows at the top of the page.
pub const THUMBNAIL_MAX_HEIGHT: u32 = 800;

/// File name of the thumbnail inside a capture's output directory.
pub const THUMBNAIL_FILE: &str = "thumb.png";

/// Subdirectory holding `{index}.png` tiles.
pub const TILES_DIR: &str = "tiles";

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("failed to read source image {}: {source}", path.display())]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("source image {} has no pixels", path.display())]
    EmptySource { path: PathBuf },
    #[error("failed to write {}: {source}", path.display())]
    DiskWrite {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("derivation task did not finish: {0}")]
    Task(String),
}

/// One horizontal strip of the source, in source pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub index: u32,
    pub y: u32,
    pub height: u32,
}

/// Files written for one capture, tiles in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedFiles {
    pub thumbnail: PathBuf,
    pub tiles: Vec<PathBuf>,
}

impl DerivedFiles {
    #[must_use]
    pub fn tile_count(&self) -> u32 {
        self.tiles.len() as u32
    }
}

/// Decode a source image.
///
/// # Errors
///
/// Returns [`DeriveError::SourceUnreadable`] if the file cannot be opened or
/// decoded, and [`DeriveError::EmptySource`] for a zero-sized raster.
pub fn open_source(path: &Path) -> Result<DynamicImage, DeriveError> {
    let unreadable = |source| DeriveError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = ImageReader::open(path)
        .and_then(ImageReader::with_guessed_format)
        .map_err(|e| unreadable(ImageError::IoError(e)))?;
    reader.no_limits();
    let img = reader.decode().map_err(unreadable)?;

    if img.width() == 0 || img.height() == 0 {
        return Err(DeriveError::EmptySource {
            path: path.to_path_buf(),
        });
    }

    Ok(img)
}

/// Thumbnail size for a source of the given size: the top
/// [`THUMBNAIL_MAX_HEIGHT`] rows at half resolution, never below 1px.
#[must_use]
pub fn thumbnail_dimensions(width: u32, height: u32) -> (u32, u32) {
    let crop_height = height.min(THUMBNAIL_MAX_HEIGHT);
    ((width / 2).max(1), (crop_height / 2).max(1))
}

/// Crop the top of the page and halve it with a Lanczos filter.
#[must_use]
pub fn make_thumbnail(source: &DynamicImage) -> DynamicImage {
    let (width, height) = source.dimensions();
    let crop_height = height.min(THUMBNAIL_MAX_HEIGHT);
    let (thumb_width, thumb_height) = thumbnail_dimensions(width, height);

    source
        .crop_imm(0, 0, width, crop_height)
        .resize_exact(thumb_width, thumb_height, FilterType::Lanczos3)
}

/// Split `height` rows into consecutive [`TILE_HEIGHT`] strips.
///
/// The last strip holds the remainder and is not padded; an exact multiple
/// of the tile height ends on a full strip with no empty one after it.
#[must_use]
pub fn tile_spans(height: u32) -> Vec<TileSpan> {
    let mut spans = Vec::with_capacity(height.div_ceil(TILE_HEIGHT) as usize);
    if height == 0 {
        return spans;
    }

    let mut index = 0;
    loop {
        let y = index * TILE_HEIGHT;
        let y_end = y.saturating_add(TILE_HEIGHT).min(height);
        spans.push(TileSpan {
            index,
            y,
            height: y_end - y,
        });
        if y_end >= height {
            break;
        }
        index += 1;
    }

    spans
}

/// Cut the source into full-width tiles at original resolution.
#[must_use]
pub fn make_tiles(source: &DynamicImage) -> Vec<DynamicImage> {
    let width = source.width();
    tile_spans(source.height())
        .into_iter()
        .map(|span| source.crop_imm(0, span.y, width, span.height))
        .collect()
}

/// Reset `out_dir`, decode `source_path` and write its thumbnail and tiles
/// there.
///
/// Anything already in `out_dir` is discarded first. Tiles are cropped and
/// written one at a time so only the source stays resident.
///
/// # Errors
///
/// Propagates decode failures, and returns [`DeriveError::DiskWrite`] for
/// any failure resetting `out_dir` or writing an output file.
pub fn derive_to_dir(source_path: &Path, out_dir: &Path) -> Result<DerivedFiles, DeriveError> {
    reset_dir(out_dir).map_err(|e| DeriveError::DiskWrite {
        path: out_dir.to_path_buf(),
        source: ImageError::IoError(e),
    })?;

    let source = open_source(source_path)?;
    let (width, height) = source.dimensions();
    debug!(
        path = %source_path.display(),
        width,
        height,
        "Decoded source image"
    );

    let thumbnail = out_dir.join(THUMBNAIL_FILE);
    write_png(&make_thumbnail(&source), &thumbnail)?;

    let tiles_dir = out_dir.join(TILES_DIR);
    std::fs::create_dir_all(&tiles_dir).map_err(|e| DeriveError::DiskWrite {
        path: tiles_dir.clone(),
        source: ImageError::IoError(e),
    })?;

    let mut tiles = Vec::new();
    for span in tile_spans(height) {
        let path = tiles_dir.join(format!("{}.png", span.index));
        write_png(&source.crop_imm(0, span.y, width, span.height), &path)?;
        tiles.push(path);
    }

    Ok(DerivedFiles { thumbnail, tiles })
}

fn write_png(img: &DynamicImage, path: &Path) -> Result<(), DeriveError> {
    img.save_with_format(path, ImageFormat::Png)
        .map_err(|source| DeriveError::DiskWrite {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        }))
    }

    #[test]
    fn test_tile_spans_with_remainder() {
        let spans = tile_spans(2500);
        assert_eq!(spans.len(), 3);
        assert_eq!(
            spans.iter().map(|s| s.height).collect::<Vec<_>>(),
            vec![1024, 1024, 452]
        );
        assert_eq!(
            spans.iter().map(|s| s.y).collect::<Vec<_>>(),
            vec![0, 1024, 2048]
        );
    }

    #[test]
    fn test_tile_spans_exact_multiple() {
        let spans = tile_spans(2048);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].height, TILE_HEIGHT);
    }

    #[test]
    fn test_tile_spans_short_image() {
        assert_eq!(
            tile_spans(10),
            vec![TileSpan {
                index: 0,
                y: 0,
                height: 10
            }]
        );
        assert!(tile_spans(0).is_empty());
    }

    #[test]
    fn test_tile_spans_cover_height() {
        for height in [1, 1023, 1024, 1025, 3000, 4096, 5000] {
            let spans = tile_spans(height);
            assert_eq!(spans.len() as u32, height.div_ceil(TILE_HEIGHT));

            let mut next_y = 0;
            for (i, span) in spans.iter().enumerate() {
                assert_eq!(span.index as usize, i);
                assert_eq!(span.y, next_y, "gap or overlap at height {height}");
                assert!(span.height > 0 && span.height <= TILE_HEIGHT);
                next_y += span.height;
            }
            assert_eq!(next_y, height);
        }
    }

    #[test]
    fn test_thumbnail_dimensions() {
        assert_eq!(thumbnail_dimensions(1024, 2500), (512, 400));
        assert_eq!(thumbnail_dimensions(1024, 600), (512, 300));
        assert_eq!(thumbnail_dimensions(1, 1), (1, 1));
        assert_eq!(thumbnail_dimensions(101, 801), (50, 400));
    }

    #[test]
    fn test_make_thumbnail_size_and_determinism() {
        let source = gradient(64, 1000);
        let a = make_thumbnail(&source);
        let b = make_thumbnail(&source);
        assert_eq!(a.dimensions(), (32, 400));
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_make_tiles_reassemble_source() {
        let source = gradient(8, 2100);
        let tiles = make_tiles(&source);
        assert_eq!(tiles.len(), 3);

        let mut y_offset = 0;
        for tile in &tiles {
            assert_eq!(tile.width(), 8);
            for y in 0..tile.height() {
                for x in 0..tile.width() {
                    assert_eq!(tile.get_pixel(x, y), source.get_pixel(x, y_offset + y));
                }
            }
            y_offset += tile.height();
        }
        assert_eq!(y_offset, 2100);
    }

    #[test]
    fn test_open_source_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();

        let err = open_source(&path).unwrap_err();
        assert!(matches!(err, DeriveError::SourceUnreadable { .. }));

        let missing = open_source(&dir.path().join("missing.png")).unwrap_err();
        assert!(matches!(missing, DeriveError::SourceUnreadable { .. }));
    }

    #[test]
    fn test_derive_to_dir_writes_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let source_path = dir.path().join("source.png");
        gradient(16, 1500).save(&source_path).unwrap();
        let out_dir = dir.path().join("out");
        std::fs::create_dir_all(out_dir.join("tiles")).unwrap();
        std::fs::write(out_dir.join("tiles/5.png"), b"stale").unwrap();

        let files = derive_to_dir(&source_path, &out_dir).unwrap();
        assert!(!out_dir.join("tiles/5.png").exists());
        assert_eq!(files.thumbnail, out_dir.join("thumb.png"));
        assert_eq!(
            files.tiles,
            vec![out_dir.join("tiles/0.png"), out_dir.join("tiles/1.png")]
        );

        let thumb = image::open(&files.thumbnail).unwrap();
        assert_eq!(thumb.dimensions(), (8, 400));
        let last = image::open(&files.tiles[1]).unwrap();
        assert_eq!(last.dimensions(), (16, 476));
    }

    #[test]
    fn test_derive_to_dir_unwritable_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let source_path = dir.path().join("source.png");
        gradient(16, 100).save(&source_path).unwrap();
        let blocker = dir.path().join("derived");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = derive_to_dir(&source_path, &blocker.join("1")).unwrap_err();
        assert!(matches!(err, DeriveError::DiskWrite { .. }));
    }

    #[test]
    fn test_write_png_into_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing/thumb.png");

        let err = write_png(&gradient(4, 4), &path).unwrap_err();
        let DeriveError::DiskWrite { path: failed, .. } = err else {
            panic!("expected a disk write error, got {err:?}");
        };
        assert_eq!(failed, path);
    }
}
