//! Units, rectangles and dpi-aware pixel arithmetic
//!
//! Logical coordinates carry a [`Unit`] and a dpi. Conversions towards or
//! from pixels need a positive dpi; conversions with an unset unit always
//! fail instead of silently using an identity transform.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TileError};

/// Ulp steps tried when snapping a back-projected pixel edge.
const SNAP_STEPS: usize = 64;

pub const POINTS_PER_INCH: f64 = 72.0;
pub const MM_PER_INCH: f64 = 25.4;

/// Unit of measure for logical coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    #[default]
    Unset,
    Millimeter,
    Point,
    Inch,
    Pixel,
}

impl Unit {
    pub fn abbr(self) -> &'static str {
        match self {
            Unit::Unset => "",
            Unit::Millimeter => "mm",
            Unit::Point => "pt",
            Unit::Inch => "in",
            Unit::Pixel => "px",
        }
    }

    /// How many inches one unit measures, `None` when undefined.
    fn inches(self, dpi: f64) -> Option<f64> {
        match self {
            Unit::Unset => None,
            Unit::Millimeter => Some(1.0 / MM_PER_INCH),
            Unit::Point => Some(1.0 / POINTS_PER_INCH),
            Unit::Inch => Some(1.0),
            Unit::Pixel if dpi.is_finite() && dpi > 0.0 => Some(1.0 / dpi),
            Unit::Pixel => None,
        }
    }
}

/// Converts `value` expressed in `from` into `to`.
pub fn convert(value: f64, from: Unit, to: Unit, dpi: f64) -> Result<f64> {
    Ok(value * factor(from, to, dpi)?)
}

/// Multiplicative factor turning a `from` measure into a `to` measure.
pub fn factor(from: Unit, to: Unit, dpi: f64) -> Result<f64> {
    if from == to && from != Unit::Unset && from != Unit::Pixel {
        return Ok(1.0);
    }
    if from == Unit::Pixel && to == Unit::Pixel {
        return Ok(1.0);
    }
    match (from.inches(dpi), to.inches(dpi)) {
        (Some(a), Some(b)) => Ok(a / b),
        _ => Err(TileError::Unit { from, to, dpi }),
    }
}

/// Something that has a size in some unit at some resolution.
pub trait Measurable {
    fn unit(&self) -> Unit;

    fn dpi(&self) -> f64;

    /// Width and height in [`Measurable::unit`].
    fn size(&self) -> (f64, f64);

    /// Factor turning this object's unit into `unit`.
    fn transform_to(&self, unit: Unit) -> Result<f64> {
        factor(self.unit(), unit, self.dpi())
    }

    fn size_in(&self, unit: Unit) -> Result<(f64, f64)> {
        let t = self.transform_to(unit)?;
        let (w, h) = self.size();
        Ok((w * t, h * t))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in logical units, stored by its corners.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    x0: f64,
    y0: f64,
    x1: f64,
    y1: f64,
    unit: Unit,
    dpi: f64,
}

impl Rect {
    /// Builds a rect, normalising negative extents so width and height are
    /// never below zero.
    pub fn new(x: f64, y: f64, width: f64, height: f64, unit: Unit, dpi: f64) -> Self {
        Self::from_corners(x, y, x + width, y + height, unit, dpi)
    }

    pub fn from_corners(x0: f64, y0: f64, x1: f64, y1: f64, unit: Unit, dpi: f64) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
            unit,
            dpi,
        }
    }

    pub fn x(&self) -> f64 {
        self.x0
    }

    pub fn y(&self) -> f64 {
        self.y0
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    pub fn x1(&self) -> f64 {
        self.x1
    }

    pub fn y1(&self) -> f64 {
        self.y1
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x0, self.y0)
    }

    pub fn top_right(&self) -> Point {
        Point::new(self.x1, self.y0)
    }

    pub fn bottom_left(&self) -> Point {
        Point::new(self.x0, self.y1)
    }

    pub fn bottom_right(&self) -> Point {
        Point::new(self.x1, self.y1)
    }

    pub fn center(&self) -> Point {
        Point::new((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn with_dpi(mut self, dpi: f64) -> Self {
        self.dpi = dpi;
        self
    }

    /// Half-open containment: the far edges belong to the neighbour.
    pub fn contains_point(&self, p: Point) -> bool {
        p.x >= self.x0 && p.x < self.x1 && p.y >= self.y0 && p.y < self.y1
    }

    /// Whether `other` lies entirely inside this rect, after bringing it
    /// to this rect's unit.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        let Ok(other) = other.convert_to(self.unit) else {
            return false;
        };
        other.x0 >= self.x0 && other.y0 >= self.y0 && other.x1 <= self.x1 && other.y1 <= self.y1
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Rect {
        Rect {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 + dx,
            y1: self.y1 + dy,
            ..*self
        }
    }

    /// Smallest rect covering both, in this rect's unit and dpi.
    pub fn union(&self, other: &Rect) -> Result<Rect> {
        let other = other.convert_to(self.unit)?;
        Ok(Rect::from_corners(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
            self.unit,
            self.dpi,
        ))
    }

    /// Same rect expressed in `unit`, keeping the dpi.
    pub fn convert_to(&self, unit: Unit) -> Result<Rect> {
        if unit == self.unit {
            return Ok(*self);
        }
        let t = factor(self.unit, unit, self.dpi)?;
        Ok(Rect::from_corners(
            self.x0 * t,
            self.y0 * t,
            self.x1 * t,
            self.y1 * t,
            unit,
            self.dpi,
        ))
    }

    /// Pixel rect covering this rect at its dpi.
    ///
    /// The origin is floored and the far corner ceiled, so the result is
    /// always a superset of the logical rect and adjacent rects never leave
    /// a gap between their pixel rects.
    pub fn to_pixel_rect(&self) -> Result<PixelRect> {
        let t = factor(self.unit, Unit::Pixel, self.dpi)?;
        let x0 = (self.x0 * t).floor();
        let y0 = (self.y0 * t).floor();
        let x1 = (self.x1 * t).ceil().max(x0);
        let y1 = (self.y1 * t).ceil().max(y0);
        Ok(PixelRect {
            x: x0 as i64,
            y: y0 as i64,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

impl Measurable for Rect {
    fn unit(&self) -> Unit {
        self.unit
    }

    fn dpi(&self) -> f64 {
        self.dpi
    }

    fn size(&self) -> (f64, f64) {
        (self.width(), self.height())
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = self.unit.abbr();
        write!(
            f,
            "({:.2}{u}, {:.2}{u}) {:.2}{u} x {:.2}{u} @ {}dpi",
            self.x0,
            self.y0,
            self.width(),
            self.height(),
            self.dpi
        )
    }
}

/// Integer rectangle in device pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn x1(&self) -> i64 {
        self.x + i64::from(self.width)
    }

    pub fn y1(&self) -> i64 {
        self.y + i64::from(self.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Back-projects this pixel rect into `unit` at `dpi`.
    ///
    /// Each edge is snapped so that [`Rect::to_pixel_rect`] gives this
    /// exact pixel rect back, and the logical rect is the widest one that
    /// does.
    pub fn to_rect(&self, unit: Unit, dpi: f64) -> Result<Rect> {
        let from_px = factor(Unit::Pixel, unit, dpi)?;
        let to_px = factor(unit, Unit::Pixel, dpi)?;
        let near = |edge| snap_edge(edge, from_px, to_px, Edge::Near);
        let far = |edge| snap_edge(edge, from_px, to_px, Edge::Far);
        Ok(Rect::from_corners(
            near(self.x),
            near(self.y),
            far(self.x1()),
            far(self.y1()),
            unit,
            dpi,
        ))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Edge {
    Near,
    Far,
}

/// Logical coordinate for pixel boundary `edge`. A near edge gets the
/// smallest value whose projection is at least `edge`, a far edge the
/// largest value whose projection is at most `edge`.
fn snap_edge(edge: i64, from_px: f64, to_px: f64, side: Edge) -> f64 {
    if edge == 0 {
        return 0.0;
    }
    let target = edge as f64;
    let fits = |v: f64| match side {
        Edge::Near => v * to_px >= target,
        Edge::Far => v * to_px <= target,
    };
    let outward = |v: f64| match side {
        Edge::Near => v.next_down(),
        Edge::Far => v.next_up(),
    };
    let inward = |v: f64| match side {
        Edge::Near => v.next_up(),
        Edge::Far => v.next_down(),
    };

    let mut v = target * from_px;
    for _ in 0..SNAP_STEPS {
        if !fits(v) {
            v = inward(v);
        } else if fits(outward(v)) {
            v = outward(v);
        } else {
            break;
        }
    }
    v
}

/// Byte multiples understood by [`format_size`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUnit {
    B,
    K,
    M,
    G,
    T,
    P,
    E,
    Z,
}

impl SizeUnit {
    const ALL: [SizeUnit; 8] = [
        SizeUnit::B,
        SizeUnit::K,
        SizeUnit::M,
        SizeUnit::G,
        SizeUnit::T,
        SizeUnit::P,
        SizeUnit::E,
        SizeUnit::Z,
    ];

    fn prefix(self) -> &'static str {
        match self {
            SizeUnit::B => "B",
            SizeUnit::K => "K",
            SizeUnit::M => "M",
            SizeUnit::G => "G",
            SizeUnit::T => "T",
            SizeUnit::P => "P",
            SizeUnit::E => "E",
            SizeUnit::Z => "Z",
        }
    }

    fn exponent(self) -> i32 {
        Self::ALL.iter().position(|u| *u == self).unwrap_or(0) as i32
    }
}

/// Formats a byte count, e.g. `1253656678 -> "1.17 Gb"`.
///
/// With `unit` set the value is expressed in that multiple, otherwise the
/// largest multiple keeping the value under 1024 is picked.
pub fn format_size(nbytes: u64, unit: Option<SizeUnit>, ndigits: usize) -> String {
    const FACTOR: f64 = 1024.0;

    if let Some(unit) = unit {
        let value = nbytes as f64 / FACTOR.powi(unit.exponent());
        return format!("{value:.ndigits$} {}b", unit.prefix());
    }

    if nbytes < 1024 {
        return format!("{nbytes} b");
    }
    let mut value = nbytes as f64;
    for unit in &SizeUnit::ALL[1..] {
        value /= FACTOR;
        if value < FACTOR {
            return format!("{value:.ndigits$} {}b", unit.prefix());
        }
    }
    format!("{:.ndigits$} Yb", value / FACTOR)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn fixed_conversion_table() {
        assert!((convert(72.0, Unit::Point, Unit::Inch, 0.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((convert(1.0, Unit::Inch, Unit::Point, 0.0).unwrap() - 72.0).abs() < 1e-12);
        assert!((convert(1.0, Unit::Inch, Unit::Millimeter, 0.0).unwrap() - 25.4).abs() < 1e-12);
        assert!((convert(25.4, Unit::Millimeter, Unit::Inch, 0.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((convert(1.0, Unit::Inch, Unit::Pixel, 300.0).unwrap() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn pixel_conversion_needs_dpi() {
        assert!(matches!(
            convert(1.0, Unit::Inch, Unit::Pixel, 0.0),
            Err(TileError::Unit { .. })
        ));
        assert!(convert(1.0, Unit::Unset, Unit::Inch, 72.0).is_err());
        assert!(convert(1.0, Unit::Unset, Unit::Unset, 72.0).is_err());
        // px -> px is an identity whatever the dpi
        assert_eq!(convert(3.0, Unit::Pixel, Unit::Pixel, 0.0).unwrap(), 3.0);
    }

    #[test]
    fn negative_extent_is_normalised() {
        let r = Rect::new(10.0, 10.0, -4.0, -2.0, Unit::Point, 72.0);
        assert_eq!(r.x(), 6.0);
        assert_eq!(r.y(), 8.0);
        assert_eq!(r.width(), 4.0);
        assert_eq!(r.height(), 2.0);
    }

    #[test]
    fn rect_getters() {
        let r = Rect::new(1.0, 2.0, 4.0, 6.0, Unit::Millimeter, 96.0);
        assert_eq!(r.bottom_right(), Point::new(5.0, 8.0));
        assert_eq!(r.top_right(), Point::new(5.0, 2.0));
        assert_eq!(r.bottom_left(), Point::new(1.0, 8.0));
        assert_eq!(r.center(), Point::new(3.0, 5.0));
        assert_eq!(r.area(), 24.0);
        assert!(r.contains_point(Point::new(1.0, 2.0)));
        assert!(!r.contains_point(Point::new(5.0, 2.0)));
        assert_eq!(r.offset(1.0, -2.0).top_left(), Point::new(2.0, 0.0));
    }

    #[test]
    fn contains_rect_across_units() {
        let page = Rect::new(0.0, 0.0, 72.0, 72.0, Unit::Point, 72.0);
        let inner = Rect::new(0.0, 0.0, 0.5, 0.5, Unit::Inch, 72.0);
        let outer = Rect::new(0.0, 0.0, 2.0, 0.5, Unit::Inch, 72.0);
        assert!(page.contains_rect(&inner));
        assert!(!page.contains_rect(&outer));
    }

    #[test]
    fn pixel_rect_rounds_outward() {
        // 0.5in .. 1.25in at 10dpi -> 5px .. 12.5px
        let r = Rect::new(0.5, 0.5, 0.75, 0.75, Unit::Inch, 10.0);
        let px = r.to_pixel_rect().unwrap();
        assert_eq!(px, PixelRect::new(5, 5, 8, 8));

        let r = Rect::new(0.33, 0.0, 0.33, 0.1, Unit::Inch, 10.0);
        let px = r.to_pixel_rect().unwrap();
        assert_eq!(px.x, 3);
        assert_eq!(px.x1(), 7);
        assert!(px.x as f64 <= 3.3 && px.x1() as f64 >= 6.6);

        // just below a boundary stays on the lower pixel
        let r = Rect::new(4.9999995, 0.0, 1.0, 1.0, Unit::Pixel, 72.0);
        let px = r.to_pixel_rect().unwrap();
        assert_eq!((px.x, px.x1()), (4, 6));
    }

    #[test]
    fn pixel_rects_cover_random_rects() {
        let mut rng = StdRng::seed_from_u64(0x7113);
        let units = [Unit::Millimeter, Unit::Point, Unit::Inch, Unit::Pixel];
        for _ in 0..2000 {
            let unit = units[rng.gen_range(0..units.len())];
            let dpi = rng.gen_range(30.0..1200.0);
            let r = Rect::new(
                rng.gen_range(-500.0..500.0),
                rng.gen_range(-500.0..500.0),
                rng.gen_range(0.01..300.0),
                rng.gen_range(0.01..300.0),
                unit,
                dpi,
            );
            let t = factor(unit, Unit::Pixel, dpi).unwrap();
            let px = r.to_pixel_rect().unwrap();
            assert!(px.x as f64 <= r.x() * t && px.y as f64 <= r.y() * t, "{r} -> {px:?}");
            assert!(px.x1() as f64 >= r.x1() * t && px.y1() as f64 >= r.y1() * t, "{r} -> {px:?}");

            let back = px.to_rect(unit, dpi).unwrap();
            assert_eq!(back.to_pixel_rect().unwrap(), px, "{back}");
            assert!(back.contains_rect(&r), "{back} does not hold {r}");
        }
    }

    #[test]
    fn back_projection_is_exact_at_awkward_dpis() {
        for dpi in [96.0, 100.0, 150.0, 299.0, 600.0] {
            for unit in [Unit::Millimeter, Unit::Point, Unit::Inch] {
                for edge in [1, 7, 100, 333, 4096, 99_999] {
                    let px = PixelRect::new(edge, -edge, 1, 3);
                    let back = px.to_rect(unit, dpi).unwrap();
                    assert_eq!(back.to_pixel_rect().unwrap(), px, "{unit:?} at {dpi}");
                }
            }
        }
    }

    #[test]
    fn pixel_rect_is_idempotent() {
        for (x, w, dpi) in [(0.1, 3.3, 72.0), (12.7, 100.01, 96.0), (0.0, 1.0, 300.0)] {
            let r = Rect::new(x, x, w, w, Unit::Millimeter, dpi);
            let px = r.to_pixel_rect().unwrap();
            let again = px.to_rect(Unit::Millimeter, dpi).unwrap().to_pixel_rect().unwrap();
            assert_eq!(px, again);
            let as_px = px.to_rect(Unit::Pixel, dpi).unwrap().to_pixel_rect().unwrap();
            assert_eq!(px, as_px);
        }
    }

    #[test]
    fn measurable_size_in() {
        let r = Rect::new(0.0, 0.0, 210.0, 297.0, Unit::Millimeter, 72.0);
        let (w, h) = r.size_in(Unit::Inch).unwrap();
        assert!((w - 210.0 / 25.4).abs() < 1e-9);
        assert!((h - 297.0 / 25.4).abs() < 1e-9);
    }

    #[test]
    fn format_size_picks_multiple() {
        assert_eq!(format_size(1_253_656_678, None, 2), "1.17 Gb");
        assert_eq!(format_size(512, None, 2), "512 b");
        assert_eq!(format_size(2048, Some(SizeUnit::K), 1), "2.0 Kb");
        assert_eq!(format_size(1_048_576, Some(SizeUnit::B), 0), "1048576 Bb");
    }
}
