use crate::deinterlace::{FieldMode, FieldReconstructor};
use crate::error::{Error, Result};
use crate::picture::{self, Picture, Sample, Samples, SamplesMut, CHANNELS};

use std::sync::Arc;

const BORDER_ROWS: usize = 2;
const BORDER_COLS: usize = 3;

/// Candidate horizontal offsets in evaluation order; ties keep the earlier one.
const SPATIAL_OFFSETS: [isize; 4] = [-1, 1, -2, 2];

/// Yadif-style field reconstruction. Each synthesized sample takes the least
/// discontinuous of five spatial interpolations between the rows above and
/// below it, then clamps that prediction to a window around the temporal
/// average of the neighbor frames. The window width comes from how much
/// those frames move.
pub struct SpatioTemporalFieldReconstructor {
    prior: Option<Arc<Picture>>,
    next: Option<Arc<Picture>>,
    spatial_check: bool,
    scratch8: RowScratch<u8>,
    scratch16: RowScratch<u16>,
}

impl Default for SpatioTemporalFieldReconstructor {
    fn default() -> Self {
        Self {
            prior: None,
            next: None,
            spatial_check: true,
            scratch8: RowScratch::default(),
            scratch16: RowScratch::default(),
        }
    }
}

impl SpatioTemporalFieldReconstructor {
    /// With the check disabled the temporal window is not widened by the
    /// samples two rows away.
    pub fn with_spatial_check(mut self, enabled: bool) -> Self {
        self.spatial_check = enabled;
        self
    }
}

/// Per-instance row buffers, sized to the current frame width on each call.
struct RowScratch<T> {
    out: Vec<T>,
    held: Vec<T>,
}

impl<T> Default for RowScratch<T> {
    fn default() -> Self {
        Self {
            out: Vec::new(),
            held: Vec::new(),
        }
    }
}

impl FieldReconstructor for SpatioTemporalFieldReconstructor {
    fn name(&self) -> &'static str {
        "yadif"
    }

    fn needs_prior_frame(&self) -> bool {
        true
    }

    fn needs_next_frame(&self) -> bool {
        true
    }

    fn set_prior_frame(&mut self, frame: Option<Arc<Picture>>) {
        self.prior = frame;
    }

    fn set_next_frame(&mut self, frame: Option<Arc<Picture>>) {
        self.next = frame;
    }

    fn reconstruct(&mut self, image: &mut Picture, mode: FieldMode) -> Result<()> {
        let (prior, next) = if mode.uses_neighbor() {
            (self.prior.as_deref(), self.next.as_deref())
        } else {
            (None, None)
        };
        for neighbor in [prior, next].into_iter().flatten() {
            picture::ensure_same_shape(image, neighbor, "yadif neighbor frame")?;
        }

        let geometry = Geometry {
            width: image.width() as usize,
            height: image.height() as usize,
            mode,
            spatial_check: self.spatial_check,
        };

        let prior = prior.map(picture::samples).transpose()?;
        let next = next.map(picture::samples).transpose()?;

        match picture::samples_mut(image)? {
            SamplesMut::Eight(dst) => {
                let prev = eight_bit(prior)?;
                let next = eight_bit(next)?;
                filter_frame(dst, prev, next, geometry, &mut self.scratch8);
            }
            SamplesMut::Sixteen(dst) => {
                let prev = sixteen_bit(prior)?;
                let next = sixteen_bit(next)?;
                filter_frame(dst, prev, next, geometry, &mut self.scratch16);
            }
        }
        Ok(())
    }
}

fn eight_bit(samples: Option<Samples<'_>>) -> Result<Option<&[u8]>> {
    match samples {
        None => Ok(None),
        Some(Samples::Eight(s)) => Ok(Some(s)),
        Some(Samples::Sixteen(_)) => Err(Error::mismatch("yadif neighbor is 16-bit, frame is 8-bit")),
    }
}

fn sixteen_bit(samples: Option<Samples<'_>>) -> Result<Option<&[u16]>> {
    match samples {
        None => Ok(None),
        Some(Samples::Sixteen(s)) => Ok(Some(s)),
        Some(Samples::Eight(_)) => Err(Error::mismatch("yadif neighbor is 8-bit, frame is 16-bit")),
    }
}

#[derive(Clone, Copy)]
struct Geometry {
    width: usize,
    height: usize,
    mode: FieldMode,
    spatial_check: bool,
}

/// Rows of one frame around the target row `y`.
#[derive(Clone, Copy)]
struct Window<'a, T> {
    up2: &'a [T],
    up: &'a [T],
    mid: &'a [T],
    down: &'a [T],
    down2: &'a [T],
}

impl<'a, T> Window<'a, T> {
    fn around(frame: &'a [T], held_up2: Option<&'a [T]>, y: usize, row_len: usize) -> Self {
        let row = move |y: usize| -> &'a [T] { &frame[y * row_len..(y + 1) * row_len] };
        Window {
            up2: held_up2.unwrap_or_else(|| row(y - 2)),
            up: row(y - 1),
            mid: row(y),
            down: row(y + 1),
            down2: row(y + 2),
        }
    }
}

fn filter_frame<T: Sample>(
    dst: &mut [T],
    prev: Option<&[T]>,
    next: Option<&[T]>,
    geo: Geometry,
    scratch: &mut RowScratch<T>,
) {
    if geo.height < 2 * BORDER_ROWS + 1 || geo.width < 2 * BORDER_COLS + 1 {
        return;
    }
    let row_len = geo.width * CHANNELS;
    let first = geo.mode.kept_parity() ^ 1;

    // `held` keeps the original content of row y-2, which this pass has
    // already overwritten by the time the frame stands in for a neighbor.
    scratch.held.clear();

    for y in (first..geo.height).step_by(2) {
        let interior = y >= BORDER_ROWS && y + BORDER_ROWS < geo.height;
        if interior {
            let own = Window::around(dst, Some(scratch.held.as_slice()), y, row_len);
            let p = prev.map_or(own, |f| Window::around(f, None, y, row_len));
            let n = next.map_or(own, |f| Window::around(f, None, y, row_len));

            scratch.out.clear();
            scratch.out.extend_from_slice(own.mid);
            for x in BORDER_COLS..geo.width - BORDER_COLS {
                for c in 0..CHANNELS {
                    let i = x * CHANNELS + c;
                    scratch.out[i] = T::from_i32(predict(&own, &p, &n, i, geo.spatial_check));
                }
            }
        }

        let r = y * row_len..(y + 1) * row_len;
        scratch.held.clear();
        scratch.held.extend_from_slice(&dst[r.clone()]);
        if interior {
            dst[r].copy_from_slice(&scratch.out);
        }
    }
}

/// Value of sample `i` on the target row.
fn predict<T: Sample>(
    cur: &Window<'_, T>,
    prev: &Window<'_, T>,
    next: &Window<'_, T>,
    i: usize,
    spatial_check: bool,
) -> i32 {
    let at = |s: isize| (i as isize + s * CHANNELS as isize) as usize;
    let v = |row: &[T], k: usize| row[k].to_i32();

    let score = |s: isize| -> i32 {
        (-1..=1)
            .map(|t| (v(cur.up, at(s + t)) - v(cur.down, at(s + t))).abs())
            .sum()
    };
    let mut best_offset = 0isize;
    let mut best_score = score(0);
    for s in SPATIAL_OFFSETS {
        let candidate = score(s);
        if candidate < best_score {
            best_score = candidate;
            best_offset = s;
        }
    }
    let spatial = (v(cur.up, at(best_offset)) + v(cur.down, at(best_offset))) / 2;

    let c = v(cur.up, i);
    let e = v(cur.down, i);
    let p2 = v(prev.mid, i);
    let n2 = v(next.mid, i);
    let d = (p2 + n2) / 2;

    let diff0 = (p2 - n2).abs() / 2;
    let diff1 = ((v(prev.up, i) - c).abs() + (v(prev.down, i) - e).abs()) / 2;
    let diff2 = ((v(next.up, i) - c).abs() + (v(next.down, i) - e).abs()) / 2;
    let mut diff = diff0.max(diff1).max(diff2);

    if spatial_check {
        let b = (v(prev.up2, i) + v(next.up2, i)) / 2;
        let f = (v(prev.down2, i) + v(next.down2, i)) / 2;
        let hi = (d - e).max(d - c).max((b - c).min(f - e));
        let lo = (d - e).min(d - c).min((b - c).max(f - e));
        diff = diff.max(lo).max(-hi);
    }

    spatial.clamp(d - diff, d + diff)
}
