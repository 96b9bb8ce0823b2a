use crate::error::{Error, Result};
use crate::picture::{self, Picture, Sample, Samples, SamplesMut};

use std::sync::Arc;

/// Replaces `target` with the per-sample truncating mean of itself and
/// `others`. Alpha is averaged like any other channel.
pub fn average(target: &mut Picture, others: &[Arc<Picture>]) -> Result<()> {
    if others.is_empty() {
        return Ok(());
    }
    for other in others {
        picture::ensure_same_shape(target, other, "averaged frame")?;
    }

    let count = 1 + others.len() as u64;
    match picture::samples_mut(target)? {
        SamplesMut::Eight(dst) => {
            let srcs = others
                .iter()
                .map(|o| match picture::samples(o)? {
                    Samples::Eight(s) => Ok(s),
                    Samples::Sixteen(_) => Err(Error::mismatch("averaged frame depth differs")),
                })
                .collect::<Result<Vec<_>>>()?;
            mean_into(dst, &srcs, count);
        }
        SamplesMut::Sixteen(dst) => {
            let srcs = others
                .iter()
                .map(|o| match picture::samples(o)? {
                    Samples::Sixteen(s) => Ok(s),
                    Samples::Eight(_) => Err(Error::mismatch("averaged frame depth differs")),
                })
                .collect::<Result<Vec<_>>>()?;
            mean_into(dst, &srcs, count);
        }
    }
    Ok(())
}

fn mean_into<T: Sample>(dst: &mut [T], srcs: &[&[T]], count: u64) {
    for (i, d) in dst.iter_mut().enumerate() {
        let sum = srcs
            .iter()
            .fold(d.to_i32() as u64, |acc, s| acc + s[i].to_i32() as u64);
        *d = T::from_i32((sum / count) as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::test_support::*;

    #[test]
    fn mean_truncates() {
        let mut target = solid8(2, 2, 10);
        let others = [Arc::new(solid8(2, 2, 11)), Arc::new(solid8(2, 2, 12))];
        average(&mut target, &others).expect("average");
        for px in target.as_bytes().chunks(4) {
            assert_eq!(px, &[11, 11, 11, 255]);
        }

        let mut target = solid8(1, 1, 1);
        average(&mut target, &[Arc::new(solid8(1, 1, 2))]).expect("average");
        assert_eq!(target.as_bytes(), &[1, 1, 1, 255]);
    }

    #[test]
    fn alpha_is_averaged_too() {
        let mut target = rgba8(1, 1, |_, _| [0, 0, 0, 0]);
        average(&mut target, &[Arc::new(rgba8(1, 1, |_, _| [9, 9, 9, 255]))]).expect("average");
        assert_eq!(target.as_bytes(), &[4, 4, 4, 127]);
    }

    #[test]
    fn sixteen_bit_sums_do_not_overflow() {
        let mut target = rgba16(2, 1, |_, _| [u16::MAX; 4]);
        let others: Vec<_> = (0..3).map(|_| Arc::new(rgba16(2, 1, |_, _| [u16::MAX; 4]))).collect();
        average(&mut target, &others).expect("average");
        let px = target.as_rgba16().expect("rgba16").get_pixel(1, 0).0;
        assert_eq!(px, [u16::MAX; 4]);
    }

    #[test]
    fn no_others_leaves_target_alone() {
        let mut target = solid8(3, 3, 77);
        average(&mut target, &[]).expect("average");
        assert_eq!(target.as_bytes(), solid8(3, 3, 77).as_bytes());
    }

    #[test]
    fn mismatched_inputs_are_fatal() {
        let mut target = solid8(2, 2, 0);
        let err = average(&mut target, &[Arc::new(solid8(2, 3, 0))]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));

        let err = average(&mut target, &[Arc::new(rgba16(2, 2, |_, _| [0; 4]))]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)));
    }
}
