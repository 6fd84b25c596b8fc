//! PNG output for image grids and confusion matrices, plus the JSON run summary.

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use image::{imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};
use log::info;
use ndarray::{ArrayView1, ArrayView2};
use palette::{LinSrgb, Mix, Srgb};
use serde::Serialize;

use crate::{
    data::{Emotion, SIDE},
    error::{FerError, Result},
    metrics::{ClassificationMetrics, ConfusionMatrix},
};

const GUTTER: u32 = 4;
const TILE_SCALE: u32 = 2;
const CELL: u32 = 56;
const MARGIN: u32 = 12;
const GLYPH_SCALE: u32 = 3;

/// A greyscale face tile from raw intensities.
pub fn tile_from_pixels(image: ArrayView2<'_, u8>) -> Result<GrayImage> {
    let (h, w) = image.dim();
    GrayImage::from_raw(w as u32, h as u32, image.iter().copied().collect())
        .ok_or_else(|| FerError::InvalidConfig(format!("cannot build a {w}×{h} tile")))
}

/// A greyscale tile from a flattened 48×48 float image, min-max stretched.
pub fn tile_from_values(values: ArrayView1<'_, f64>) -> Result<GrayImage> {
    let (lo, hi) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    let bytes = values
        .iter()
        .map(|&v| {
            if range > 0.0 {
                ((v - lo) / range * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect();
    GrayImage::from_raw(SIDE as u32, SIDE as u32, bytes).ok_or_else(|| {
        FerError::InvalidConfig(format!("expected {} values, got {}", SIDE * SIDE, values.len()))
    })
}

/// Tiles laid out row-major; `None` leaves a blank slot.
#[derive(Debug, Clone)]
pub struct ImageGrid {
    pub columns: usize,
    pub tiles: Vec<Option<GrayImage>>,
}

impl ImageGrid {
    pub fn new(columns: usize) -> Self {
        Self {
            columns: columns.max(1),
            tiles: Vec::new(),
        }
    }

    pub fn push(&mut self, tile: Option<GrayImage>) {
        self.tiles.push(tile);
    }

    pub fn render(&self) -> GrayImage {
        let side = SIDE as u32 * TILE_SCALE;
        let cols = self.columns as u32;
        let rows = self.tiles.len().div_ceil(self.columns).max(1) as u32;
        let width = cols * side + (cols + 1) * GUTTER;
        let height = rows * side + (rows + 1) * GUTTER;
        let mut canvas = GrayImage::from_pixel(width, height, Luma([255]));

        for (i, tile) in self.tiles.iter().enumerate() {
            let Some(tile) = tile else { continue };
            let scaled = image::imageops::resize(tile, side, side, FilterType::Nearest);
            let x = GUTTER + (i % self.columns) as u32 * (side + GUTTER);
            let y = GUTTER + (i / self.columns) as u32 * (side + GUTTER);
            image::imageops::overlay(&mut canvas, &scaled, x.into(), y.into());
        }
        canvas
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryEntry {
    pub name: String,
    #[serde(flatten)]
    pub metrics: ClassificationMetrics,
}

/// Owns the output directory and collects one summary entry per classifier.
#[derive(Debug)]
pub struct Reporter {
    dir: PathBuf,
    summary: Vec<SummaryEntry>,
}

impl Reporter {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            summary: Vec::new(),
        })
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    pub fn save_grid(&self, file: &str, grid: &ImageGrid) -> Result<PathBuf> {
        let path = self.path(file);
        grid.render().save(&path)?;
        info!("Saved {}", path.display());
        Ok(path)
    }

    /// Builds the confusion matrix, renders `<name>.png`, and records the
    /// metrics for the summary.
    pub fn confusion_report(
        &mut self,
        name: &str,
        targets: &[usize],
        predictions: &[usize],
    ) -> Result<ClassificationMetrics> {
        let matrix = ConfusionMatrix::from_labels(targets, predictions);
        let path = self.path(&format!("{name}.png"));
        render_confusion(&matrix).save(&path)?;
        info!("Saved {}", path.display());

        let mut metrics = ClassificationMetrics::new();
        metrics.calculate(&matrix);
        metrics.print_summary(name);
        log_matrix(&matrix);

        self.summary.push(SummaryEntry {
            name: name.to_string(),
            metrics: metrics.clone(),
        });
        Ok(metrics)
    }

    pub fn summary(&self) -> &[SummaryEntry] {
        &self.summary
    }

    pub fn write_summary(&self) -> Result<PathBuf> {
        let path = self.path("summary.json");
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, &self.summary)?;
        info!("Saved {}", path.display());
        Ok(path)
    }
}

fn log_matrix(matrix: &ConfusionMatrix) {
    let header: String = Emotion::ALL.iter().map(|e| format!("{:>9}", e.name())).collect();
    info!("{:>9}{header}", "");
    for (emotion, row) in Emotion::ALL.iter().zip(matrix.normalized().rows()) {
        let cells: String = row.iter().map(|v| format!("{:>8.1}%", v * 100.0)).collect();
        info!("{:>9}{cells}", emotion.name());
    }
}

/// Row-normalized heatmap, one cell per (true, predicted) pair, each annotated
/// with its percentage.
pub fn render_confusion(matrix: &ConfusionMatrix) -> RgbImage {
    let n = matrix.counts.nrows() as u32;
    let size = 2 * MARGIN + n * CELL;
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([255, 255, 255]));
    let normalized = matrix.normalized();

    let light: LinSrgb = Srgb::new(0.97f32, 0.98, 1.0).into_linear();
    let dark: LinSrgb = Srgb::new(0.03f32, 0.19, 0.42).into_linear();

    for ((row, col), &value) in normalized.indexed_iter() {
        let t = value.clamp(0.0, 1.0) as f32;
        let colour: Srgb<f32> = Srgb::from_linear(light.mix(dark, t));
        let colour: Srgb<u8> = colour.into_format();
        let fill = Rgb([colour.red, colour.green, colour.blue]);

        let x0 = MARGIN + col as u32 * CELL;
        let y0 = MARGIN + row as u32 * CELL;
        for y in y0..y0 + CELL - 1 {
            for x in x0..x0 + CELL - 1 {
                canvas.put_pixel(x, y, fill);
            }
        }

        let ink = if t > 0.5 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        };
        let text = format!("{:.0}%", value * 100.0);
        let width = text_width(&text);
        let tx = x0 + (CELL - 1).saturating_sub(width) / 2;
        let ty = y0 + (CELL - 1).saturating_sub(5 * GLYPH_SCALE) / 2;
        draw_text(&mut canvas, &text, tx, ty, ink);
    }
    canvas
}

/// 3×5 bitmap glyphs, one `u8` per row, high bit on the left.
fn glyph(c: char) -> Option<[u8; 5]> {
    Some(match c {
        '0' => [0b111, 0b101, 0b101, 0b101, 0b111],
        '1' => [0b010, 0b110, 0b010, 0b010, 0b111],
        '2' => [0b111, 0b001, 0b111, 0b100, 0b111],
        '3' => [0b111, 0b001, 0b111, 0b001, 0b111],
        '4' => [0b101, 0b101, 0b111, 0b001, 0b001],
        '5' => [0b111, 0b100, 0b111, 0b001, 0b111],
        '6' => [0b111, 0b100, 0b111, 0b101, 0b111],
        '7' => [0b111, 0b001, 0b001, 0b001, 0b001],
        '8' => [0b111, 0b101, 0b111, 0b101, 0b111],
        '9' => [0b111, 0b101, 0b111, 0b001, 0b111],
        '%' => [0b101, 0b001, 0b010, 0b100, 0b101],
        '.' => [0b000, 0b000, 0b000, 0b000, 0b010],
        _ => return None,
    })
}

fn text_width(text: &str) -> u32 {
    let n = text.chars().count() as u32;
    (n * 4).saturating_sub(1) * GLYPH_SCALE
}

fn draw_text(canvas: &mut RgbImage, text: &str, x: u32, y: u32, ink: Rgb<u8>) {
    for (i, c) in text.chars().enumerate() {
        let Some(rows) = glyph(c) else { continue };
        let gx = x + i as u32 * 4 * GLYPH_SCALE;
        for (r, bits) in rows.iter().enumerate() {
            for col in 0..3u32 {
                if bits & (0b100 >> col) == 0 {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        let px = gx + col * GLYPH_SCALE + dx;
                        let py = y + r as u32 * GLYPH_SCALE + dy;
                        if px < canvas.width() && py < canvas.height() {
                            canvas.put_pixel(px, py, ink);
                        }
                    }
                }
            }
        }
    }
}
