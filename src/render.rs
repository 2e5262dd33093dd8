//! Heat-map rendering for delta vectors
//!
//! The core hands a 2-D grid (one row for a single delta vector) plus a
//! [`HeatmapSpec`] to an [`AuditRenderer`]. Colors come from a diverging
//! scale centered at zero, so sign reads as hue and magnitude as saturation.

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::capture::{CapturePoint, Sublayer};
use crate::delta::DeltaVector;
use crate::error::{AuditError, Result};

/// 8-bit RGB color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }

    fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let mix = |a: u8, b: u8| (f32::from(a) + (f32::from(b) - f32::from(a)) * t).round() as u8;
        Rgb(mix(self.0, other.0), mix(self.1, other.1), mix(self.2, other.2))
    }
}

/// Color scale with a neutral midpoint, mapped symmetrically around zero
#[derive(Debug, Clone, PartialEq)]
pub struct DivergingScale {
    stops: Vec<Rgb>,
}

impl DivergingScale {
    /// ColorBrewer RdBu, reversed: blue for negative, red for positive
    pub fn rd_bu_r() -> Self {
        Self {
            stops: vec![
                Rgb(5, 48, 97),
                Rgb(33, 102, 172),
                Rgb(67, 147, 195),
                Rgb(146, 197, 222),
                Rgb(209, 229, 240),
                Rgb(247, 247, 247),
                Rgb(253, 219, 199),
                Rgb(244, 165, 130),
                Rgb(214, 96, 77),
                Rgb(178, 24, 43),
                Rgb(103, 0, 31),
            ],
        }
    }

    /// Color for `value` on a scale spanning `[-limit, +limit]`
    ///
    /// Values outside the range clamp to the end colors; a non-positive
    /// limit maps everything to the midpoint.
    pub fn color(&self, value: f32, limit: f32) -> Rgb {
        let t = if limit > 0.0 && value.is_finite() {
            ((value / limit).clamp(-1.0, 1.0) + 1.0) / 2.0
        } else {
            0.5
        };
        let position = t * (self.stops.len() - 1) as f32;
        let lower = position.floor() as usize;
        let upper = (lower + 1).min(self.stops.len() - 1);
        self.stops[lower].lerp(self.stops[upper], position - lower as f32)
    }

    pub fn stops(&self) -> &[Rgb] {
        &self.stops
    }
}

impl Default for DivergingScale {
    fn default() -> Self {
        Self::rd_bu_r()
    }
}

/// Axis and colorbar labels
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapLabels {
    pub x_label: String,
    /// Row labels clutter a single-row map, so they are off by default
    pub y_label_visible: bool,
    pub color_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Margins {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapStyle {
    pub background: String,
    pub margins: Margins,
    pub width: u32,
    pub height: u32,
}

impl Default for HeatmapStyle {
    fn default() -> Self {
        Self {
            background: "white".to_string(),
            margins: Margins {
                left: 40,
                right: 40,
                top: 60,
                bottom: 40,
            },
            width: 1000,
            height: 350,
        }
    }
}

/// Everything a renderer needs besides the numbers
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapSpec {
    pub title: String,
    pub labels: HeatmapLabels,
    pub scale: DivergingScale,
    pub style: HeatmapStyle,
}

impl HeatmapSpec {
    /// Spec for showing the first `units` entries of a delta at `point`
    ///
    /// `model_name` is the display name used in the title, e.g. "GPT-2".
    pub fn for_delta(model_name: &str, point: &CapturePoint, units: usize) -> Self {
        let unit_name = match point.sublayer() {
            Sublayer::FeedForward => "Neuron",
            _ => "Unit",
        };
        Self {
            title: format!(
                "Forensic Audit: Safety Circuit Map ({model_name} Layer {})",
                point.layer()
            ),
            labels: HeatmapLabels {
                x_label: format!("Individual {unit_name} Index (Top {units} {unit_name}s)"),
                y_label_visible: false,
                color_label: "Delta".to_string(),
            },
            scale: DivergingScale::rd_bu_r(),
            style: HeatmapStyle::default(),
        }
    }
}

/// Single-row grid holding the first `max_units` entries of `delta`
pub fn delta_grid(delta: &DeltaVector, max_units: usize) -> Vec<Vec<f32>> {
    vec![delta.head(max_units).to_vec()]
}

/// A display surface for heat maps
pub trait AuditRenderer {
    fn render(&self, grid: &[Vec<f32>], spec: &HeatmapSpec) -> Result<()>;
}

/// Check the grid is rectangular and non-empty; returns `(rows, cols)`
fn grid_shape(grid: &[Vec<f32>]) -> Result<(usize, usize)> {
    let cols = grid
        .first()
        .map(Vec::len)
        .ok_or_else(|| AuditError::Render("grid has no rows".to_string()))?;
    if cols == 0 {
        return Err(AuditError::Render("grid has no columns".to_string()));
    }
    if let Some(row) = grid.iter().position(|r| r.len() != cols) {
        return Err(AuditError::Render(format!(
            "row {row} has {} cells, expected {cols}",
            grid[row].len()
        )));
    }
    Ok((grid.len(), cols))
}

/// Symmetric color limit: the largest finite magnitude in the grid
fn color_limit(grid: &[Vec<f32>]) -> f32 {
    grid.iter()
        .flatten()
        .filter(|v| v.is_finite())
        .fold(0.0f32, |acc, v| acc.max(v.abs()))
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

const COLORBAR_SPACE: f32 = 80.0;
const COLORBAR_WIDTH: f32 = 16.0;
const X_AXIS_SPACE: f32 = 44.0;
const Y_AXIS_SPACE: f32 = 28.0;

/// Render `grid` as a standalone SVG document
pub fn render_svg(grid: &[Vec<f32>], spec: &HeatmapSpec) -> Result<String> {
    let (rows, cols) = grid_shape(grid)?;
    let mut svg = String::new();
    draw_svg(&mut svg, grid, rows, cols, spec)
        .map_err(|e| AuditError::Render(format!("SVG formatting failed: {e}")))?;
    Ok(svg)
}

fn draw_svg(
    svg: &mut String,
    grid: &[Vec<f32>],
    rows: usize,
    cols: usize,
    spec: &HeatmapSpec,
) -> std::fmt::Result {
    let style = &spec.style;
    let width = style.width as f32;
    let height = style.height as f32;
    let m = style.margins;
    let limit = color_limit(grid);

    let y_space = if spec.labels.y_label_visible {
        Y_AXIS_SPACE
    } else {
        0.0
    };
    let x0 = m.left as f32 + y_space;
    let x1 = (width - m.right as f32 - COLORBAR_SPACE).max(x0 + 1.0);
    let y0 = m.top as f32;
    let y1 = (height - m.bottom as f32 - X_AXIS_SPACE).max(y0 + 1.0);
    let cell_w = (x1 - x0) / cols as f32;
    let cell_h = (y1 - y0) / rows as f32;

    writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}" font-family="Helvetica, Arial, sans-serif">"#,
        style.width, style.height, style.width, style.height
    )?;
    writeln!(
        svg,
        r#"<rect width="100%" height="100%" fill="{}"/>"#,
        escape_xml(&style.background)
    )?;
    writeln!(
        svg,
        r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="16" font-weight="bold">{}</text>"#,
        width / 2.0,
        y0 / 2.0 + 6.0,
        escape_xml(&spec.title)
    )?;

    // Cells
    writeln!(svg, r#"<g class="cells">"#)?;
    for (r, row) in grid.iter().enumerate() {
        for (c, &value) in row.iter().enumerate() {
            let color = spec.scale.color(value, limit);
            writeln!(
                svg,
                r#"<rect x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}" fill="{}"><title>{}: {:+.4}</title></rect>"#,
                x0 + c as f32 * cell_w,
                y0 + r as f32 * cell_h,
                cell_w,
                cell_h,
                color.hex(),
                c,
                value
            )?;
        }
    }
    writeln!(svg, "</g>")?;

    // X axis ticks at cell centers
    let tick_step = if cols > 20 { 5 } else { 1 };
    for c in (0..cols).step_by(tick_step) {
        let x = x0 + (c as f32 + 0.5) * cell_w;
        writeln!(
            svg,
            r#"<line x1="{x:.2}" y1="{y1:.2}" x2="{x:.2}" y2="{:.2}" stroke="black"/>"#,
            y1 + 4.0
        )?;
        writeln!(
            svg,
            r#"<text x="{x:.2}" y="{:.2}" text-anchor="middle" font-size="11">{c}</text>"#,
            y1 + 16.0
        )?;
    }
    writeln!(
        svg,
        r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-size="13">{}</text>"#,
        (x0 + x1) / 2.0,
        y1 + 36.0,
        escape_xml(&spec.labels.x_label)
    )?;

    if spec.labels.y_label_visible {
        for r in 0..rows {
            writeln!(
                svg,
                r#"<text x="{:.2}" y="{:.2}" text-anchor="end" font-size="11" dominant-baseline="middle">{r}</text>"#,
                x0 - 6.0,
                y0 + (r as f32 + 0.5) * cell_h
            )?;
        }
    }

    // Colorbar: bottom is -limit, top is +limit
    let bar_x = x1 + 20.0;
    writeln!(
        svg,
        r#"<defs><linearGradient id="diverging" x1="0" y1="1" x2="0" y2="0">"#
    )?;
    let last = spec.scale.stops().len().saturating_sub(1).max(1);
    for (i, stop) in spec.scale.stops().iter().enumerate() {
        writeln!(
            svg,
            r#"<stop offset="{:.3}" stop-color="{}"/>"#,
            i as f32 / last as f32,
            stop.hex()
        )?;
    }
    writeln!(svg, "</linearGradient></defs>")?;
    writeln!(
        svg,
        r#"<rect x="{bar_x:.2}" y="{y0:.2}" width="{COLORBAR_WIDTH}" height="{:.2}" fill="url(#diverging)" stroke="black" stroke-width="0.5"/>"#,
        y1 - y0
    )?;
    writeln!(
        svg,
        r#"<text x="{bar_x:.2}" y="{:.2}" font-size="12">{}</text>"#,
        y0 - 8.0,
        escape_xml(&spec.labels.color_label)
    )?;
    for (value, y) in [(limit, y0), (0.0, (y0 + y1) / 2.0), (-limit, y1)] {
        writeln!(
            svg,
            r#"<text x="{:.2}" y="{y:.2}" font-size="11" dominant-baseline="middle">{value:.3}</text>"#,
            bar_x + COLORBAR_WIDTH + 4.0
        )?;
    }

    writeln!(svg, "</svg>")
}

/// Writes the heat map to an SVG file
#[derive(Debug, Clone)]
pub struct SvgRenderer {
    path: PathBuf,
}

impl SvgRenderer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditRenderer for SvgRenderer {
    fn render(&self, grid: &[Vec<f32>], spec: &HeatmapSpec) -> Result<()> {
        let svg = render_svg(grid, spec)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, svg)?;
        info!("Heat map written to {}", self.path.display());
        Ok(())
    }
}

/// Prints the heat map as a 24-bit color strip on stdout
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalRenderer;

/// Two-column ANSI cell per value, with a unit index ruler under each row
pub fn render_ansi(grid: &[Vec<f32>], spec: &HeatmapSpec) -> Result<String> {
    let (_, cols) = grid_shape(grid)?;
    let limit = color_limit(grid);

    let mut out = String::new();
    out.push_str(&spec.title);
    out.push('\n');
    for row in grid {
        for &value in row {
            let Rgb(r, g, b) = spec.scale.color(value, limit);
            out.push_str(&format!("\x1b[48;2;{r};{g};{b}m  \x1b[0m"));
        }
        out.push('\n');
    }

    let mut ruler = String::new();
    for c in (0..cols).step_by(10) {
        ruler.push_str(&format!("{:<20}", c));
    }
    out.push_str(ruler.trim_end());
    out.push('\n');
    out.push_str(&format!(
        "{} (blue < 0 < red, |max| = {limit:.4})\n",
        spec.labels.x_label
    ));
    out.push_str(&format!("{}: [-{limit:.4}, +{limit:.4}]\n", spec.labels.color_label));
    Ok(out)
}

impl AuditRenderer for TerminalRenderer {
    fn render(&self, grid: &[Vec<f32>], spec: &HeatmapSpec) -> Result<()> {
        print!("{}", render_ansi(grid, spec)?);
        Ok(())
    }
}
