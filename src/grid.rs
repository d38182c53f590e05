//! Fixed-size 2D container with aliasing views
//!
//! A [`TypedGrid`] is a handle on a shared backing store plus the column and
//! row range it exposes. Slicing never copies items: every view of a grid
//! reads and writes the same slots, and every view can be sliced again.

use std::fmt;
use std::ops::{Bound, Range, RangeBounds};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Result, TileError};

/// Largest number of columns or rows a grid may have.
pub const MAX_GRID_EDGE: usize = 65_535;

struct Store<T> {
    width: usize,
    height: usize,
    slots: Vec<RwLock<Option<T>>>,
}

/// Row-major grid of optional items.
pub struct TypedGrid<T> {
    store: Arc<Store<T>>,
    cols: Range<usize>,
    rows: Range<usize>,
}

impl<T> Clone for TypedGrid<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cols: self.cols.clone(),
            rows: self.rows.clone(),
        }
    }
}

impl<T> TypedGrid<T> {
    /// Allocates `width * height` empty slots.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        for edge in [width, height] {
            if edge > MAX_GRID_EDGE {
                return Err(TileError::CapacityExceeded {
                    len: edge,
                    limit: MAX_GRID_EDGE,
                });
            }
        }
        let slots = (0..width * height).map(|_| RwLock::new(None)).collect();
        Ok(Self {
            store: Arc::new(Store {
                width,
                height,
                slots,
            }),
            cols: 0..width,
            rows: 0..height,
        })
    }

    /// Builds a grid with every slot filled by `f(x, y)`.
    pub fn from_fn(width: usize, height: usize, mut f: impl FnMut(usize, usize) -> T) -> Result<Self> {
        let grid = Self::new(width, height)?;
        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                *grid.store.slots[idx]
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(f(x, y));
            }
        }
        Ok(grid)
    }

    pub fn width(&self) -> usize {
        self.cols.len()
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }

    /// `(columns, rows)` of this view.
    pub fn shape(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    pub fn len(&self) -> usize {
        self.width() * self.height()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Position of this view's first cell in the base grid.
    pub fn origin(&self) -> (usize, usize) {
        (self.cols.start, self.rows.start)
    }

    /// Shape of the whole backing store.
    pub fn base_shape(&self) -> (usize, usize) {
        (self.store.width, self.store.height)
    }

    /// Whether this handle exposes only part of the backing store.
    pub fn is_view(&self) -> bool {
        self.shape() != self.base_shape()
    }

    /// Handle on the whole backing store.
    pub fn base(&self) -> TypedGrid<T> {
        TypedGrid {
            store: Arc::clone(&self.store),
            cols: 0..self.store.width,
            rows: 0..self.store.height,
        }
    }

    /// Whether both handles alias the same backing store.
    pub fn shares_store(&self, other: &TypedGrid<T>) -> bool {
        Arc::ptr_eq(&self.store, &other.store)
    }

    /// Maps view coordinates (negative ones count from the end) to the
    /// absolute position in the base grid.
    pub fn resolve(&self, x: isize, y: isize) -> Result<(usize, usize)> {
        let out_of_range = || TileError::OutOfRange {
            x,
            y,
            width: self.width(),
            height: self.height(),
        };
        let ax = wrap_index(x, self.width()).ok_or_else(out_of_range)?;
        let ay = wrap_index(y, self.height()).ok_or_else(out_of_range)?;
        Ok((self.cols.start + ax, self.rows.start + ay))
    }

    fn slot(&self, x: isize, y: isize) -> Result<&RwLock<Option<T>>> {
        let (bx, by) = self.resolve(x, y)?;
        Ok(&self.store.slots[by * self.store.width + bx])
    }

    /// Runs `f` with shared access to the item at `(x, y)`.
    pub fn with_item<R>(&self, x: isize, y: isize, f: impl FnOnce(Option<&T>) -> R) -> Result<R> {
        let guard = self
            .slot(x, y)?
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(f(guard.as_ref()))
    }

    /// Runs `f` with exclusive access to the slot at `(x, y)`.
    pub fn update<R>(&self, x: isize, y: isize, f: impl FnOnce(&mut Option<T>) -> R) -> Result<R> {
        let mut guard = self
            .slot(x, y)?
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut guard))
    }

    /// Stores `item` (or clears the slot with `None`), returning the
    /// previous content.
    pub fn set(&self, x: isize, y: isize, item: impl Into<Option<T>>) -> Result<Option<T>> {
        let item = item.into();
        self.update(x, y, |slot| std::mem::replace(slot, item))
    }

    /// Sub-view over `cols` x `rows`, relative to this view.
    pub fn slice(
        &self,
        cols: impl RangeBounds<usize>,
        rows: impl RangeBounds<usize>,
    ) -> Result<TypedGrid<T>> {
        let c = self.sub_range(&cols, self.width(), true)?;
        let r = self.sub_range(&rows, self.height(), false)?;
        Ok(TypedGrid {
            store: Arc::clone(&self.store),
            cols: self.cols.start + c.start..self.cols.start + c.end,
            rows: self.rows.start + r.start..self.rows.start + r.end,
        })
    }

    fn sub_range(
        &self,
        bounds: &impl RangeBounds<usize>,
        len: usize,
        horizontal: bool,
    ) -> Result<Range<usize>> {
        let start = match bounds.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 0,
        };
        let end = match bounds.end_bound() {
            Bound::Included(&e) => e + 1,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        };
        if start > end || end > len {
            let bad = (if end > len { end } else { start }) as isize;
            let (x, y) = if horizontal { (bad, 0) } else { (0, bad) };
            return Err(TileError::OutOfRange {
                x,
                y,
                width: self.width(),
                height: self.height(),
            });
        }
        Ok(start..end)
    }

    /// View coordinates in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = (usize, usize)> + use<T> {
        let (w, h) = self.shape();
        (0..h).flat_map(move |y| (0..w).map(move |x| (x, y)))
    }
}

impl<T: Clone> TypedGrid<T> {
    pub fn get(&self, x: isize, y: isize) -> Result<Option<T>> {
        self.with_item(x, y, |item| item.cloned())
    }

    /// Lazily yields the items of this view, row after row. Calling it
    /// again starts a fresh pass.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            grid: self,
            next: 0,
        }
    }
}

impl<T: PartialEq> TypedGrid<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.positions().any(|(x, y)| {
            self.with_item(x as isize, y as isize, |slot| slot == Some(item))
                .unwrap_or(false)
        })
    }
}

fn wrap_index(i: isize, len: usize) -> Option<usize> {
    let len = len as isize;
    let i = if i < 0 { i + len } else { i };
    (0..len).contains(&i).then_some(i as usize)
}

/// Row-major iterator over a [`TypedGrid`] view.
pub struct Iter<'a, T> {
    grid: &'a TypedGrid<T>,
    next: usize,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = Option<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let w = self.grid.width();
        if w == 0 || self.next >= self.grid.len() {
            return None;
        }
        let (x, y) = (self.next % w, self.next / w);
        self.next += 1;
        self.grid.get(x as isize, y as isize).ok()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.grid.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl<T: Clone> ExactSizeIterator for Iter<'_, T> {}

impl<T> fmt::Debug for TypedGrid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedGrid")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("base_shape", &self.base_shape())
            .finish()
    }
}
