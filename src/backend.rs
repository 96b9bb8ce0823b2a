use crate::deinterlace::{FieldMode, FieldReconstructor};
use crate::error::{Error, Result};
use crate::picture::Picture;
use crate::util;

use image::{DynamicImage, ImageBuffer};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba8,
    Rgba16,
}

impl PixelFormat {
    fn of(picture: &Picture) -> Result<Self> {
        match picture {
            DynamicImage::ImageRgba8(_) => Ok(PixelFormat::Rgba8),
            DynamicImage::ImageRgba16(_) => Ok(PixelFormat::Rgba16),
            other => Err(Error::UnsupportedDepth(format!("{:?}", other.color()))),
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::Rgba16 => 8,
        }
    }
}

/// Identity of a constructed filter graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub mode: FieldMode,
}

impl GraphKey {
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// External filter-graph engine. Graph construction and execution are opaque
/// to the caller; only buffer size and layout are part of the contract.
pub trait FieldReconstructionBackend: Send {
    type Graph: Send;

    fn name(&self) -> &'static str {
        "backend"
    }

    fn build_graph(&mut self, key: &GraphKey) -> Result<Self::Graph>;

    /// Returns a buffer with the same size and layout as `frame`.
    fn run(&mut self, graph: &mut Self::Graph, key: &GraphKey, frame: &[u8]) -> Result<Vec<u8>>;
}

pub struct BackendFieldReconstructor<B: FieldReconstructionBackend> {
    backend: B,
    graphs: HashMap<GraphKey, B::Graph>,
}

impl<B: FieldReconstructionBackend> BackendFieldReconstructor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            graphs: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn cached_graphs(&self) -> usize {
        self.graphs.len()
    }
}

impl<B: FieldReconstructionBackend> FieldReconstructor for BackendFieldReconstructor<B> {
    fn name(&self) -> &'static str {
        self.backend.name()
    }

    fn cool_down(&mut self) {
        self.graphs.clear();
    }

    fn reconstruct(&mut self, image: &mut Picture, mode: FieldMode) -> Result<()> {
        let key = GraphKey {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::of(image)?,
            mode,
        };

        if !self.graphs.contains_key(&key) {
            let graph = self.backend.build_graph(&key)?;
            self.graphs.insert(key, graph);
        }
        let Some(graph) = self.graphs.get_mut(&key) else {
            return Err(Error::backend("graph cache lost its entry"));
        };

        let out = self.backend.run(graph, &key, image.as_bytes())?;
        if out.len() != key.frame_bytes() {
            return Err(Error::mismatch(format!(
                "backend returned {} bytes for a {}x{} {:?} frame ({} expected)",
                out.len(),
                key.width,
                key.height,
                key.format,
                key.frame_bytes()
            )));
        }
        *image = picture_from_bytes(&key, out)?;
        Ok(())
    }
}

fn picture_from_bytes(key: &GraphKey, bytes: Vec<u8>) -> Result<Picture> {
    let picture = match key.format {
        PixelFormat::Rgba8 => {
            ImageBuffer::from_raw(key.width, key.height, bytes).map(DynamicImage::ImageRgba8)
        }
        PixelFormat::Rgba16 => {
            let samples: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_ne_bytes([c[0], c[1]]))
                .collect();
            ImageBuffer::from_raw(key.width, key.height, samples).map(DynamicImage::ImageRgba16)
        }
    };
    picture.ok_or_else(|| Error::mismatch("backend buffer does not fit the frame"))
}

/// Runs each frame through the `ffmpeg` executable's deinterlacing filters.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    program: String,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegGraph {
    filter: String,
    pix_fmt: &'static str,
    size: String,
}

impl FfmpegBackend {
    #[cfg(test)]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        cmd
    }
}

fn filter_for(mode: FieldMode) -> String {
    let parity = match mode.kept_parity() {
        0 => "tff",
        _ => "bff",
    };
    let filter = if mode.uses_neighbor() { "yadif" } else { "bwdif" };
    format!("setfield={parity},{filter}=mode=send_frame:parity={parity}:deint=all")
}

fn pix_fmt_for(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Rgba8 => "rgba",
        PixelFormat::Rgba16 if cfg!(target_endian = "big") => "rgba64be",
        PixelFormat::Rgba16 => "rgba64le",
    }
}

impl FieldReconstructionBackend for FfmpegBackend {
    type Graph = FfmpegGraph;

    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    /// Validates the filter chain once against a synthetic source so a broken
    /// installation fails before the first real frame.
    fn build_graph(&mut self, key: &GraphKey) -> Result<FfmpegGraph> {
        let graph = FfmpegGraph {
            filter: filter_for(key.mode),
            pix_fmt: pix_fmt_for(key.format),
            size: format!("{}x{}", key.width, key.height),
        };

        let output = self
            .base_command()
            .arg("-f")
            .arg("lavfi")
            .arg("-i")
            .arg(format!("color=c=black:s={}:d=1,format={}", graph.size, graph.pix_fmt))
            .arg("-vf")
            .arg(&graph.filter)
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("null")
            .arg("-")
            .output()
            .map_err(|e| Error::backend(format!("failed to start {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(Error::backend(format!(
                "could not build filter graph {:?} for {} {}: {}",
                graph.filter,
                graph.size,
                graph.pix_fmt,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(graph)
    }

    fn run(&mut self, graph: &mut FfmpegGraph, key: &GraphKey, frame: &[u8]) -> Result<Vec<u8>> {
        let mut child = self
            .base_command()
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg(graph.pix_fmt)
            .arg("-s")
            .arg(&graph.size)
            .arg("-i")
            .arg("pipe:0")
            .arg("-vf")
            .arg(&graph.filter)
            .arg("-frames:v")
            .arg("1")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg(graph.pix_fmt)
            .arg("pipe:1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::backend(format!("failed to start {}: {}", self.program, e)))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::backend("ffmpeg stderr missing"))?;
        let stderr_handle = util::spawn_stderr_collector(stderr);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::backend("ffmpeg stdin missing"))?;
        let input = frame.to_vec();
        let feeder = std::thread::spawn(move || -> std::io::Result<()> {
            stdin.write_all(&input)?;
            stdin.flush()
        });

        let mut out = Vec::with_capacity(key.frame_bytes());
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_end(&mut out)?;
        }
        let status = child.wait()?;
        let fed = feeder.join().unwrap_or_else(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "stdin feeder panicked"))
        });
        let stderr_lines = stderr_handle.join().unwrap_or_default();

        if !status.success() {
            return Err(Error::backend(format!(
                "ffmpeg exited with {} running {:?}: {}",
                status,
                graph.filter,
                stderr_lines.join(" | ")
            )));
        }
        fed?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picture::test_support::*;

    #[derive(Default)]
    struct Invert {
        builds: usize,
        fail_build: bool,
        truncate: bool,
    }

    impl FieldReconstructionBackend for Invert {
        type Graph = GraphKey;

        fn build_graph(&mut self, key: &GraphKey) -> Result<GraphKey> {
            if self.fail_build {
                return Err(Error::backend("link failed: Invalid argument"));
            }
            self.builds += 1;
            Ok(*key)
        }

        fn run(&mut self, graph: &mut GraphKey, key: &GraphKey, frame: &[u8]) -> Result<Vec<u8>> {
            assert_eq!(graph, key);
            let mut out: Vec<u8> = frame.iter().map(|b| 255 - b).collect();
            if self.truncate {
                out.pop();
            }
            Ok(out)
        }
    }

    #[test]
    fn graphs_are_cached_per_structured_key() {
        let mut r = BackendFieldReconstructor::new(Invert::default());
        let mut a = solid8(4, 4, 10);
        r.reconstruct(&mut a, FieldMode::TopFieldOnly).expect("first");
        r.reconstruct(&mut a, FieldMode::TopFieldOnly).expect("second");
        assert_eq!(r.backend.builds, 1);
        assert_eq!(a.as_bytes()[0], 10);

        let mut b = solid8(4, 6, 10);
        r.reconstruct(&mut b, FieldMode::TopFieldOnly).expect("other size");
        r.reconstruct(&mut a, FieldMode::BottomFieldFirst).expect("other mode");
        assert_eq!(r.backend.builds, 3);
        assert_eq!(r.cached_graphs(), 3);
        assert_eq!(r.name(), "backend");
        assert_eq!(BackendFieldReconstructor::new(FfmpegBackend::default()).name(), "ffmpeg");
    }

    #[test]
    fn cool_down_drops_cached_graphs() {
        let mut r = BackendFieldReconstructor::new(Invert::default());
        let mut a = solid8(4, 4, 10);
        r.reconstruct(&mut a, FieldMode::TopFieldOnly).expect("run");
        r.cool_down();
        assert_eq!(r.cached_graphs(), 0);
        r.reconstruct(&mut a, FieldMode::TopFieldOnly).expect("run again");
        assert_eq!(r.backend.builds, 2);
    }

    #[test]
    fn sixteen_bit_frames_round_trip_through_bytes() {
        let mut r = BackendFieldReconstructor::new(Invert::default());
        let mut pic = rgba16(3, 2, |_, _| [0x0102, 0, 0xffff, 0x00ff]);
        r.reconstruct(&mut pic, FieldMode::TopFieldFirst).expect("run");
        let px = pic.as_rgba16().expect("rgba16").get_pixel(0, 0).0;
        assert_eq!(px, [0xfefd, 0xffff, 0x0000, 0xff00]);
    }

    #[test]
    fn short_buffer_is_a_dimension_mismatch() {
        let mut r = BackendFieldReconstructor::new(Invert {
            truncate: true,
            ..Invert::default()
        });
        let mut a = solid8(4, 4, 10);
        let err = r.reconstruct(&mut a, FieldMode::TopFieldOnly).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn build_failure_carries_backend_diagnostic() {
        let mut r = BackendFieldReconstructor::new(Invert {
            fail_build: true,
            ..Invert::default()
        });
        let err = r.reconstruct(&mut solid8(4, 4, 1), FieldMode::TopFieldOnly).unwrap_err();
        assert!(err.to_string().contains("Invalid argument"), "{err}");
    }

    #[test]
    fn missing_executable_fails_with_context() {
        let mut r = BackendFieldReconstructor::new(FfmpegBackend::with_program("fieldmend-no-such-ffmpeg"));
        let err = r.reconstruct(&mut solid8(8, 8, 1), FieldMode::TopFieldOnly).unwrap_err();
        assert!(err.to_string().contains("fieldmend-no-such-ffmpeg"), "{err}");
    }

    #[test]
    fn ffmpeg_backend_keeps_frame_geometry() {
        if util::ensure_ffmpeg_available().is_err() {
            return;
        }
        let mut r = BackendFieldReconstructor::new(FfmpegBackend::default());
        let mut pic = rgba8(16, 12, |x, y| [(x * 10) as u8, (y * 10) as u8, 128, 255]);
        r.reconstruct(&mut pic, FieldMode::TopFieldFirst).expect("ffmpeg run");
        assert_eq!((pic.width(), pic.height()), (16, 12));
        assert_eq!(pic.color(), image::ColorType::Rgba8);
    }
}
