use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::ops::Range;
use std::process::Command;
use std::thread::JoinHandle;
use std::time::Duration;

pub fn ensure_ffmpeg_available() -> Result<()> {
    let out = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .context("failed to run ffmpeg -version")?;
    if !out.status.success() {
        bail!("ffmpeg exists but returned non-zero on -version");
    }
    Ok(())
}

/// Keeps the last few non-empty lines a child process wrote to stderr.
pub fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line).unwrap_or(0);
            if read == 0 {
                break;
            }
            let cleaned = line.trim().to_string();
            if cleaned.is_empty() {
                continue;
            }
            lines.push_back(cleaned);
            if lines.len() > 20 {
                lines.pop_front();
            }
        }
        lines.into_iter().collect()
    })
}

/// Parses `A..B` (half-open), `A..` or `..B`. Missing bounds default to
/// zero and `u64::MAX`.
pub fn parse_range(text: &str) -> Result<Range<u64>> {
    let Some((lo, hi)) = text.split_once("..") else {
        bail!("range {:?} must look like START..END", text);
    };
    let start = match lo.trim() {
        "" => 0,
        s => s
            .parse::<u64>()
            .with_context(|| format!("bad range start {:?}", s))?,
    };
    let end = match hi.trim() {
        "" => u64::MAX,
        s => s
            .parse::<u64>()
            .with_context(|| format!("bad range end {:?}", s))?,
    };
    if end < start {
        bail!("range {:?} ends before it starts", text);
    }
    Ok(start..end)
}

/// Frame selection for tagging: a single index `N` or a range `A..B`,
/// clipped to the movie length.
pub fn parse_frame_selection(text: &str, len: usize) -> Result<Range<usize>> {
    let range = if text.contains("..") {
        parse_range(text)?
    } else {
        let n = text
            .trim()
            .parse::<u64>()
            .with_context(|| format!("bad frame index {:?}", text))?;
        n..n + 1
    };
    let start = usize::try_from(range.start).unwrap_or(usize::MAX);
    let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
    if start >= end {
        bail!("selection {:?} matches no frames (movie has {})", text, len);
    }
    Ok(start..end)
}

/// `A,B` -> `(A, B)`
pub fn parse_pair(text: &str) -> Result<(usize, usize)> {
    let Some((a, b)) = text.split_once(',') else {
        bail!("expected two comma separated frame indices, got {:?}", text);
    };
    let a = a.trim().parse().with_context(|| format!("bad frame index {:?}", a))?;
    let b = b.trim().parse().with_context(|| format!("bad frame index {:?}", b))?;
    Ok((a, b))
}

pub fn fmt_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
