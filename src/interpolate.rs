use crate::average;
use crate::error::{Error, Result};
use crate::picture::{self, Picture};
use crate::util;

use clap::ValueEnum;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Synthesizes a frame between two source frames.
pub trait FrameInterpolator: Send {
    fn name(&self) -> &'static str;

    fn can_interpolate_middle_frame(&self) -> bool;

    /// Produces a frame temporally centered between `prior` and `after`.
    fn interpolate(&mut self, prior: &Picture, after: &Picture) -> Result<Picture>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum InterpolatorKind {
    None,
    Blend,
    External,
}

pub fn build_interpolator(
    kind: InterpolatorKind,
    command: Option<&str>,
) -> Result<Box<dyn FrameInterpolator>> {
    match kind {
        InterpolatorKind::None => Ok(Box::new(NullInterpolator)),
        InterpolatorKind::Blend => Ok(Box::new(BlendInterpolator)),
        InterpolatorKind::External => {
            let Some(template) = command else {
                return Err(Error::Interpolation(
                    "external interpolator needs a command template".to_string(),
                ));
            };
            Ok(Box::new(ExternalProcessInterpolator::new(template)?))
        }
    }
}

/// Declines every request.
pub struct NullInterpolator;

impl FrameInterpolator for NullInterpolator {
    fn name(&self) -> &'static str {
        "none"
    }

    fn can_interpolate_middle_frame(&self) -> bool {
        false
    }

    fn interpolate(&mut self, _prior: &Picture, _after: &Picture) -> Result<Picture> {
        Err(Error::Interpolation("no interpolator selected".to_string()))
    }
}

/// Per-sample mean of the two sources.
pub struct BlendInterpolator;

impl FrameInterpolator for BlendInterpolator {
    fn name(&self) -> &'static str {
        "blend"
    }

    fn can_interpolate_middle_frame(&self) -> bool {
        true
    }

    fn interpolate(&mut self, prior: &Picture, after: &Picture) -> Result<Picture> {
        let mut out = prior.clone();
        average::average(&mut out, &[Arc::new(after.clone())])?;
        Ok(out)
    }
}

const PRIOR: &str = "{prior}";
const AFTER: &str = "{after}";
const OUTPUT: &str = "{output}";

/// Runs an executable that reads two PNG files and writes a third. The
/// template is split on whitespace; `{prior}`, `{after}` and `{output}` are
/// replaced with paths inside a scratch directory.
pub struct ExternalProcessInterpolator {
    program: String,
    args: Vec<String>,
}

impl ExternalProcessInterpolator {
    pub fn new(template: &str) -> Result<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            return Err(Error::Interpolation("empty interpolator command".to_string()));
        };
        let args: Vec<String> = parts.collect();
        if !args.iter().any(|a| a.contains(OUTPUT)) {
            return Err(Error::Interpolation(format!(
                "interpolator command {:?} never mentions {}",
                template, OUTPUT
            )));
        }
        Ok(Self { program, args })
    }

    fn command_for(&self, prior: &Path, after: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        for arg in &self.args {
            cmd.arg(
                arg.replace(PRIOR, &prior.to_string_lossy())
                    .replace(AFTER, &after.to_string_lossy())
                    .replace(OUTPUT, &output.to_string_lossy()),
            );
        }
        cmd
    }
}

impl FrameInterpolator for ExternalProcessInterpolator {
    fn name(&self) -> &'static str {
        "external"
    }

    fn can_interpolate_middle_frame(&self) -> bool {
        true
    }

    fn interpolate(&mut self, prior: &Picture, after: &Picture) -> Result<Picture> {
        picture::ensure_same_shape(prior, after, "interpolation source")?;

        let scratch = tempfile::Builder::new()
            .prefix("fieldmend-interp-")
            .tempdir()?;
        let prior_path = scratch.path().join("prior.png");
        let after_path = scratch.path().join("after.png");
        let output_path = scratch.path().join("output.png");
        picture::save_png_atomic(prior, &prior_path)?;
        picture::save_png_atomic(after, &after_path)?;

        let mut child = self
            .command_for(&prior_path, &after_path, &output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Interpolation(format!("failed to start {}: {}", self.program, e)))?;
        let stderr_handle = child.stderr.take().map(util::spawn_stderr_collector);
        let status = child.wait()?;
        let stderr_lines = stderr_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(Error::Interpolation(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                stderr_lines.join(" | ")
            )));
        }
        if !output_path.is_file() {
            return Err(Error::Interpolation(format!(
                "{} did not write {}",
                self.program,
                output_path.display()
            )));
        }

        let mut out = picture::load(&output_path)?;
        // A tool may hand back 8-bit output for 16-bit input; match the sources.
        if out.color() != prior.color() {
            out = match prior {
                Picture::ImageRgba16(_) => Picture::ImageRgba16(out.to_rgba16()),
                _ => Picture::ImageRgba8(out.to_rgba8()),
            };
        }
        picture::ensure_same_shape(prior, &out, "interpolated frame")?;
        Ok(out)
    }
}
