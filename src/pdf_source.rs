//! PDF pages rasterised through MuPDF
//!
//! MuPDF documents are bound to the thread that opened them, so every
//! worker keeps its own handle and regions are drawn straight into a
//! pixmap covering only the requested pixels.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use log::debug;
use mupdf::{Colorspace, Device, Document, Matrix, Pixmap};

use crate::error::{Result, TileError};
use crate::measure::{Measurable, Rect, Unit, factor};
use crate::pixel::{PixelBuffer, PixelFormat, PixelSource};

/// PDF user space is measured in points.
const PDF_DPI: f64 = 72.0;

thread_local! {
    static DOCUMENT: RefCell<Option<(PathBuf, Document)>> = const { RefCell::new(None) };
}

fn pdf_error(e: mupdf::Error) -> TileError {
    TileError::source(e.to_string())
}

pub struct PdfSource {
    path: PathBuf,
    page: usize,
    format: PixelFormat,
    bounds: Rect,
}

impl PdfSource {
    pub fn open(path: &Path, page: usize, format: PixelFormat) -> Result<Self> {
        let bounds = with_document(path, |doc| {
            let b = doc.load_page(page as i32).map_err(pdf_error)?.bounds().map_err(pdf_error)?;
            Ok(Rect::from_corners(
                f64::from(b.x0),
                f64::from(b.y0),
                f64::from(b.x1),
                f64::from(b.y1),
                Unit::Point,
                PDF_DPI,
            ))
        })?;
        debug!("Opened page {page} of {path:?}: {bounds}");
        Ok(Self {
            path: path.to_path_buf(),
            page,
            format,
            bounds,
        })
    }

    /// Page extent in points, anchored at the origin.
    pub fn surface(&self) -> Rect {
        Rect::new(
            0.0,
            0.0,
            self.bounds.width(),
            self.bounds.height(),
            Unit::Point,
            PDF_DPI,
        )
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

fn with_document<T>(path: &Path, f: impl FnOnce(&Document) -> Result<T>) -> Result<T> {
    DOCUMENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let stale = slot.as_ref().is_none_or(|(p, _)| p != path);
        if stale {
            let doc = Document::open(path.to_string_lossy().as_ref()).map_err(pdf_error)?;
            *slot = Some((path.to_path_buf(), doc));
        }
        match slot.as_ref() {
            Some((_, doc)) => f(doc),
            None => Err(TileError::source("document handle missing")),
        }
    })
}

impl PixelSource for PdfSource {
    fn fetch(&self, rect: &Rect, _scale: u32) -> Result<PixelBuffer> {
        let px = rect.to_pixel_rect()?;
        // pixels per point at the grid's virtual dpi
        let zoom = factor(Unit::Point, Unit::Pixel, rect.dpi())? as f32;

        let samples = with_document(&self.path, |doc| {
            let page = doc.load_page(self.page as i32).map_err(pdf_error)?;
            let matrix = Matrix::new(
                zoom,
                0.0,
                0.0,
                zoom,
                -(self.bounds.x() as f32) * zoom,
                -(self.bounds.y() as f32) * zoom,
            );
            let colorspace = Colorspace::device_rgb();
            let mut pixmap = Pixmap::new(
                &colorspace,
                px.x as i32,
                px.y as i32,
                px.width as i32,
                px.height as i32,
                false,
            )
            .map_err(pdf_error)?;
            pixmap.clear_with(0xFF).map_err(pdf_error)?;

            let device = Device::from_pixmap(&pixmap).map_err(pdf_error)?;
            page.run(&device, &matrix).map_err(pdf_error)?;
            drop(device);

            Ok(pack_rows(&pixmap))
        })?;

        let expected = PixelFormat::R8G8B8.buffer_len(px.width, px.height);
        if samples.len() != expected {
            return Err(TileError::contract(format!(
                "pixmap yielded {} bytes for {}x{}, expected {expected}",
                samples.len(),
                px.width,
                px.height
            )));
        }
        let bytes = if self.format == PixelFormat::R8G8B8 {
            samples
        } else {
            let mut bytes = Vec::with_capacity(self.format.buffer_len(px.width, px.height));
            for i in 0..(px.width as usize * px.height as usize) {
                self.format
                    .push_rgba(PixelFormat::R8G8B8.rgba_at(&samples, i), &mut bytes);
            }
            bytes
        };
        let buffer = PixelBuffer::new(px.width, px.height, self.format, bytes);
        buffer.validate()?;
        Ok(buffer)
    }
}

/// Strips row padding from an RGB pixmap.
fn pack_rows(pixmap: &Pixmap) -> Vec<u8> {
    let n = pixmap.n() as usize;
    let width = pixmap.width() as usize;
    let height = pixmap.height() as usize;
    let stride = pixmap.stride() as usize;
    let samples = pixmap.samples();
    let row_bytes = width * n;

    let mut out = Vec::with_capacity(width * height * 3);
    for row in samples.chunks(stride).take(height) {
        let row = &row[..row_bytes.min(row.len())];
        if n == 3 {
            out.extend_from_slice(row);
        } else {
            for px in row.chunks_exact(n) {
                out.extend_from_slice(&px[..3]);
            }
        }
    }
    out
}
