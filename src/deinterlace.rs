use crate::backend::{BackendFieldReconstructor, FfmpegBackend};
use crate::error::{Error, Result};
use crate::movie::FrameAction;
use crate::picture::{self, Picture, Sample, Samples, SamplesMut, CHANNELS};
use crate::yadif::SpatioTemporalFieldReconstructor;

use clap::ValueEnum;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldMode {
    TopFieldOnly,
    BottomFieldOnly,
    TopFieldFirst,
    BottomFieldFirst,
}

impl FieldMode {
    pub fn from_action(action: FrameAction) -> Option<Self> {
        match action {
            FrameAction::TopFieldOnly => Some(FieldMode::TopFieldOnly),
            FrameAction::BottomFieldOnly => Some(FieldMode::BottomFieldOnly),
            FrameAction::TopFieldFirst => Some(FieldMode::TopFieldFirst),
            FrameAction::BottomFieldFirst => Some(FieldMode::BottomFieldFirst),
            _ => None,
        }
    }

    /// Row parity kept from the input: 0 for the top (even) field.
    pub fn kept_parity(self) -> usize {
        match self {
            FieldMode::TopFieldOnly | FieldMode::TopFieldFirst => 0,
            FieldMode::BottomFieldOnly | FieldMode::BottomFieldFirst => 1,
        }
    }

    pub fn uses_neighbor(self) -> bool {
        matches!(self, FieldMode::TopFieldFirst | FieldMode::BottomFieldFirst)
    }

    /// True for rows that belong to the field being synthesized.
    pub fn is_synthesized_row(self, y: usize) -> bool {
        (self.kept_parity() ^ (y & 1)) == 1
    }
}

/// Synthesizes the rows of one field of a frame. `*Only` modes rebuild the
/// unwanted field from the frame itself; `*First` modes may draw it from a
/// neighbor frame the renderer injects beforehand.
pub trait FieldReconstructor: Send {
    fn name(&self) -> &'static str;

    fn needs_prior_frame(&self) -> bool {
        false
    }

    fn needs_next_frame(&self) -> bool {
        false
    }

    fn set_prior_frame(&mut self, _frame: Option<Arc<Picture>>) {}

    fn set_next_frame(&mut self, _frame: Option<Arc<Picture>>) {}

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Releases cached heavyweight resources while the strategy is inactive.
    fn cool_down(&mut self) {}

    fn reconstruct(&mut self, image: &mut Picture, mode: FieldMode) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ReconstructorKind {
    Basic,
    Yadif,
    Ffmpeg,
}

/// `spatial_check` only affects the yadif kernel.
pub fn build_reconstructor(kind: ReconstructorKind, spatial_check: bool) -> Box<dyn FieldReconstructor> {
    match kind {
        ReconstructorKind::Basic => Box::new(BasicFieldReconstructor::default()),
        ReconstructorKind::Yadif => Box::new(
            SpatioTemporalFieldReconstructor::default().with_spatial_check(spatial_check),
        ),
        ReconstructorKind::Ffmpeg => Box::new(BackendFieldReconstructor::new(FfmpegBackend::default())),
    }
}

/// Line doubling for `*Only`, neighbor field transplant for `*First`.
#[derive(Default)]
pub struct BasicFieldReconstructor {
    prior: Option<Arc<Picture>>,
}

impl FieldReconstructor for BasicFieldReconstructor {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn needs_prior_frame(&self) -> bool {
        true
    }

    fn set_prior_frame(&mut self, frame: Option<Arc<Picture>>) {
        self.prior = frame;
    }

    fn reconstruct(&mut self, image: &mut Picture, mode: FieldMode) -> Result<()> {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let row_len = width * CHANNELS;

        let neighbor = if mode.uses_neighbor() {
            self.prior.as_deref()
        } else {
            None
        };

        match neighbor {
            Some(prior) => {
                picture::ensure_same_shape(image, prior, "basic neighbor frame")?;
                match (picture::samples_mut(image)?, picture::samples(prior)?) {
                    (SamplesMut::Eight(dst), Samples::Eight(src)) => {
                        transplant_field(dst, src, row_len, height, mode)
                    }
                    (SamplesMut::Sixteen(dst), Samples::Sixteen(src)) => {
                        transplant_field(dst, src, row_len, height, mode)
                    }
                    _ => return Err(Error::mismatch("basic neighbor frame depth differs")),
                }
            }
            None => match picture::samples_mut(image)? {
                SamplesMut::Eight(dst) => interpolate_field(dst, row_len, height, mode),
                SamplesMut::Sixteen(dst) => interpolate_field(dst, row_len, height, mode),
            },
        }
        Ok(())
    }
}

fn transplant_field<T: Sample>(dst: &mut [T], src: &[T], row_len: usize, height: usize, mode: FieldMode) {
    for y in (0..height).filter(|&y| mode.is_synthesized_row(y)) {
        let row = y * row_len..(y + 1) * row_len;
        dst[row.clone()].copy_from_slice(&src[row]);
    }
}

fn interpolate_field<T: Sample>(dst: &mut [T], row_len: usize, height: usize, mode: FieldMode) {
    if height < 3 {
        return;
    }
    // Rows above and below a synthesized row belong to the kept field, so
    // writing in place never reads a value produced in this pass.
    for y in (1..height - 1).filter(|&y| mode.is_synthesized_row(y)) {
        for i in 0..row_len {
            let above = dst[(y - 1) * row_len + i].to_i32();
            let below = dst[(y + 1) * row_len + i].to_i32();
            dst[y * row_len + i] = T::from_i32((above + below) / 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::test_support::*;

    #[test]
    fn synthesized_rows_follow_mode_parity() {
        assert!(!FieldMode::TopFieldOnly.is_synthesized_row(0));
        assert!(FieldMode::TopFieldOnly.is_synthesized_row(1));
        assert!(FieldMode::BottomFieldFirst.is_synthesized_row(0));
        assert!(!FieldMode::BottomFieldFirst.is_synthesized_row(3));
    }

    #[test]
    fn only_mode_averages_neighbor_rows_and_skips_borders() {
        let mut pic = rgba8(4, 6, |x, y| [(y * y * 10) as u8, x as u8, 7, 255]);
        let before = pic.clone();
        let mut r = BasicFieldReconstructor::default();
        r.reconstruct(&mut pic, FieldMode::TopFieldOnly).expect("reconstruct");

        for y in [0u32, 2, 4] {
            assert_eq!(row8(&pic, y), row8(&before, y));
        }
        // Row 1: (0 + 40) / 2; row 3: (40 + 160) / 2.
        assert_eq!(row8(&pic, 1)[0], 20);
        assert_eq!(row8(&pic, 3)[0], 100);
        // Last row has no row below it and stays as it was.
        assert_eq!(row8(&pic, 5), row8(&before, 5));
    }

    #[test]
    fn only_mode_truncates_toward_zero() {
        let mut pic = rgba8(1, 3, |_, y| if y == 0 { [1, 1, 1, 1] } else { [2, 2, 2, 2] });
        BasicFieldReconstructor::default()
            .reconstruct(&mut pic, FieldMode::TopFieldOnly)
            .expect("reconstruct");
        assert_eq!(row8(&pic, 1), vec![1, 1, 1, 1]);
    }

    #[test]
    fn first_mode_copies_unwanted_rows_from_neighbor() {
        let mut pic = rgba8(5, 6, |x, y| [(x + y) as u8, 1, 2, 255]);
        let before = pic.clone();
        let neighbor = Arc::new(rgba8(5, 6, |x, y| [200 - (x * y) as u8, 9, 9, 255]));

        let mut r = BasicFieldReconstructor::default();
        r.set_prior_frame(Some(Arc::clone(&neighbor)));
        r.reconstruct(&mut pic, FieldMode::BottomFieldFirst).expect("reconstruct");

        for y in 0..6u32 {
            if y % 2 == 0 {
                assert_eq!(row8(&pic, y), row8(&neighbor, y), "row {y}");
            } else {
                assert_eq!(row8(&pic, y), row8(&before, y), "row {y}");
            }
        }
    }

    #[test]
    fn first_mode_without_neighbor_falls_back_to_interpolation() {
        let mut pic = rgba8(2, 3, |_, y| [(y * 100) as u8, 0, 0, 255]);
        let mut r = BasicFieldReconstructor::default();
        r.reconstruct(&mut pic, FieldMode::TopFieldFirst).expect("reconstruct");
        assert_eq!(row8(&pic, 1)[0], 100);
    }

    #[test]
    fn sixteen_bit_path_matches_eight_bit_structure() {
        let mut pic = rgba16(3, 3, |_, y| [(y as u16) * 30_000, 0, 0, u16::MAX]);
        BasicFieldReconstructor::default()
            .reconstruct(&mut pic, FieldMode::TopFieldOnly)
            .expect("reconstruct");
        let samples = pic.as_rgba16().expect("rgba16");
        assert_eq!(samples.get_pixel(1, 1)[0], 30_000);
    }

    #[test]
    fn neighbor_shape_mismatch_is_fatal() {
        let mut pic = solid8(4, 4, 1);
        let mut r = BasicFieldReconstructor::default();
        r.set_prior_frame(Some(Arc::new(solid8(4, 6, 1))));
        let err = r.reconstruct(&mut pic, FieldMode::TopFieldFirst).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }
}
