use crate::error::Result;
use crate::movie::{FrameAction, Movie, Tag};
use crate::picture::{self, Sample, Samples, CHANNELS};

/// Noise margin on the 8-bit scale; 16-bit frames scale it by 257.
const NOISE_MARGIN: i32 = 10;

/// Fraction of color samples in interior rows that are combed. A sample is
/// combed when it sits outside the range of both vertical neighbors by more
/// than the noise margin, the zig-zag a frame woven from two moments in time
/// shows on moving edges.
pub fn combedness(picture: &picture::Picture) -> Result<f32> {
    let width = picture.width() as usize;
    let height = picture.height() as usize;
    let score = match picture::samples(picture)? {
        Samples::Eight(s) => comb_fraction(s, width, height, NOISE_MARGIN),
        Samples::Sixteen(s) => comb_fraction(s, width, height, NOISE_MARGIN * 257),
    };
    Ok(score)
}

fn comb_fraction<T: Sample>(samples: &[T], width: usize, height: usize, margin: i32) -> f32 {
    if height < 3 || width == 0 {
        return 0.0;
    }
    let row_len = width * CHANNELS;
    let mut combed = 0u64;
    let mut total = 0u64;
    for y in 1..height - 1 {
        for x in 0..width {
            // Alpha is skipped.
            for c in 0..CHANNELS - 1 {
                let i = y * row_len + x * CHANNELS + c;
                let cur = samples[i].to_i32();
                let up = cur - samples[i - row_len].to_i32();
                let down = cur - samples[i + row_len].to_i32();
                total += 1;
                if (up > margin && down > margin) || (up < -margin && down < -margin) {
                    combed += 1;
                }
            }
        }
    }
    combed as f32 / total as f32
}

#[derive(Debug, Clone, Copy)]
pub struct AutoTag {
    pub threshold: f32,
    pub action: FrameAction,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub frames: usize,
    pub tagged: usize,
    pub max_score: f32,
}

/// Scores every frame, storing the result on the frame. With `auto_tag`,
/// untagged frames scoring at or above the threshold receive its action.
pub fn analyze_movie(
    movie: &mut Movie,
    auto_tag: Option<AutoTag>,
    mut on_frame: impl FnMut(usize, f32),
) -> Result<AnalysisReport> {
    let mut report = AnalysisReport::default();
    for index in 0..movie.len() {
        let Some(path) = movie.frame_path(index) else {
            continue;
        };
        let score = combedness(&picture::load(&path)?)?;
        report.frames += 1;
        report.max_score = report.max_score.max(score);

        let untagged = match movie.frame_mut(index) {
            Some(frame) => {
                frame.combedness = Some(score);
                frame.action == FrameAction::Unknown
            }
            None => false,
        };
        if let Some(rule) = auto_tag {
            if untagged && score >= rule.threshold {
                movie.retag(index, Tag::action(rule.action))?;
                report.tagged += 1;
            }
        }
        on_frame(index, score);
    }
    Ok(report)
}
