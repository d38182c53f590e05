use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use simplelog::{Config, LevelFilter, WriteLogger};

use tilepool::measure::{SizeUnit, format_size};
use tilepool::panic_handler::initialize_panic_handler;
use tilepool::pattern::Pattern;
use tilepool::settings::load_settings;
use tilepool::{Clip, Measurable, PixelFormat, PixelSource, Rect, TilesPool, Unit, Viewport};

/// Render one window of a large surface into a PNG.
#[derive(Parser, Debug)]
#[command(name = "tilepool", version)]
struct Args {
    /// Surface width in millimetres (ignored with --pdf)
    #[arg(long, default_value_t = 210.0)]
    width_mm: f64,

    /// Surface height in millimetres (ignored with --pdf)
    #[arg(long, default_value_t = 297.0)]
    height_mm: f64,

    /// Base resolution of the surface
    #[arg(long, default_value_t = 72.0)]
    dpi: f64,

    /// Index into the configured zoom scales
    #[arg(long, default_value_t = 0)]
    scale_index: usize,

    /// Point to centre the window on, in surface units
    #[arg(long, default_value_t = 0.0)]
    x: f64,
    #[arg(long, default_value_t = 0.0)]
    y: f64,

    /// Checkerboard cell size in pixels; a gradient is drawn when absent
    #[arg(long)]
    checker: Option<u32>,

    #[arg(long, default_value = "clip.png")]
    out: PathBuf,

    /// Rasterise a PDF page instead of a generated pattern
    #[cfg(feature = "pdf")]
    #[arg(long)]
    pdf: Option<PathBuf>,

    #[cfg(feature = "pdf")]
    #[arg(long, default_value_t = 0)]
    page: usize,

    /// Settings file, defaults to the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = args.log_level.parse().unwrap_or(LevelFilter::Info);
    WriteLogger::init(
        level,
        Config::default(),
        File::create("tilepool.log")?,
    )?;
    initialize_panic_handler();

    info!("Starting tilepool");
    let result = run(&args);
    if let Err(e) = &result {
        error!("Render failed: {e:?}");
    }
    info!("Shutting down tilepool");
    result
}

fn run(args: &Args) -> Result<()> {
    let settings = load_settings(args.config.as_deref());
    let (surface, source) = build_source(args, settings.memory_format)?;

    let viewport = Viewport::new(surface.width(), surface.height(), surface.unit(), surface.dpi());
    let config = settings.tiles_config(surface, viewport)?;
    let mut pool = TilesPool::new(config, source)?;

    pool.set_rendering(args.x, args.y, args.scale_index)?;
    let clip = pool.render()?;
    if clip.is_empty() {
        anyhow::bail!("nothing to render for this viewport");
    }
    write_png(&clip, &args.out)
        .with_context(|| format!("writing {}", args.out.display()))?;

    let stats = pool.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    eprintln!(
        "{}x{} clip written to {} ({} compressed of {})",
        clip.width,
        clip.height,
        args.out.display(),
        format_size(stats.total.total_compressed, None, 2),
        format_size(stats.total.total_uncompressed, Some(SizeUnit::M), 2),
    );
    Ok(())
}

fn build_source(args: &Args, format: PixelFormat) -> Result<(Rect, Arc<dyn PixelSource>)> {
    if let Some(found) = pdf_source(args, format)? {
        return Ok(found);
    }

    let surface = Rect::new(
        0.0,
        0.0,
        args.width_mm,
        args.height_mm,
        Unit::Millimeter,
        args.dpi,
    );
    let pattern = match args.checker {
        Some(cell) => Pattern::checker(format, cell),
        None => Pattern::gradient(format),
    };
    Ok((surface, Arc::new(pattern)))
}

#[cfg(feature = "pdf")]
fn pdf_source(args: &Args, format: PixelFormat) -> Result<Option<(Rect, Arc<dyn PixelSource>)>> {
    let Some(path) = &args.pdf else {
        return Ok(None);
    };
    let source = tilepool::pdf_source::PdfSource::open(path, args.page, format)?;
    Ok(Some((source.surface(), Arc::new(source))))
}

#[cfg(not(feature = "pdf"))]
fn pdf_source(_args: &Args, _format: PixelFormat) -> Result<Option<(Rect, Arc<dyn PixelSource>)>> {
    Ok(None)
}

fn write_png(clip: &Clip, path: &Path) -> Result<()> {
    let (color, data) = png_layout(clip);

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = png::Encoder::new(file, clip.width, clip.height);
    encoder.set_color(color);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&data)?;
    Ok(())
}

/// PNG only knows RGB(A) and grayscale, other layouts are reordered.
fn png_layout(clip: &Clip) -> (png::ColorType, Vec<u8>) {
    let format = clip.format;
    match format {
        PixelFormat::G8 => (png::ColorType::Grayscale, clip.bytes().to_vec()),
        PixelFormat::R8G8B8 => (png::ColorType::Rgb, clip.bytes().to_vec()),
        PixelFormat::R8G8B8A8 => (png::ColorType::Rgba, clip.bytes().to_vec()),
        _ => {
            let pixels = clip.width as usize * clip.height as usize;
            let alpha = format.has_alpha();
            let mut out = Vec::with_capacity(pixels * if alpha { 4 } else { 3 });
            for i in 0..pixels {
                let [r, g, b, a] = format.rgba_at(clip.bytes(), i);
                out.extend_from_slice(&[r, g, b]);
                if alpha {
                    out.push(a);
                }
            }
            let color = if alpha {
                png::ColorType::Rgba
            } else {
                png::ColorType::Rgb
            };
            (color, out)
        }
    }
}
