use crate::error::{Error, Result};

use image::{ColorType, DynamicImage, ImageFormat};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A frame normalized to RGBA8 or RGBA16. Pixel paths work on the flat
/// sample slice, four samples per pixel.
pub type Picture = DynamicImage;

pub const CHANNELS: usize = 4;

/// Scalar sample of one channel.
pub trait Sample: Copy + Send + Sync + 'static {
    const MAX: i32;
    fn to_i32(self) -> i32;
    /// Saturates into the valid channel range.
    fn from_i32(v: i32) -> Self;
}

impl Sample for u8 {
    const MAX: i32 = u8::MAX as i32;

    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(v: i32) -> Self {
        v.clamp(0, <Self as Sample>::MAX) as u8
    }
}

impl Sample for u16 {
    const MAX: i32 = u16::MAX as i32;

    fn to_i32(self) -> i32 {
        self as i32
    }

    fn from_i32(v: i32) -> Self {
        v.clamp(0, <Self as Sample>::MAX) as u16
    }
}

pub enum Samples<'a> {
    Eight(&'a [u8]),
    Sixteen(&'a [u16]),
}

pub enum SamplesMut<'a> {
    Eight(&'a mut [u8]),
    Sixteen(&'a mut [u16]),
}

/// Row stride in bytes, derived from the raw buffer rather than the color type.
pub fn row_stride(picture: &Picture) -> usize {
    let height = picture.height().max(1) as usize;
    picture.as_bytes().len() / height
}

fn unsupported(picture: &Picture) -> Error {
    Error::UnsupportedDepth(format!(
        "{:?} with row stride {} for width {}",
        picture.color(),
        row_stride(picture),
        picture.width()
    ))
}

pub fn samples(picture: &Picture) -> Result<Samples<'_>> {
    let width = picture.width() as usize;
    let stride = row_stride(picture);
    match picture {
        DynamicImage::ImageRgba16(buf) if stride == width * 8 => Ok(Samples::Sixteen(&**buf)),
        DynamicImage::ImageRgba8(buf) if stride == width * 4 => Ok(Samples::Eight(&**buf)),
        other => Err(unsupported(other)),
    }
}

pub fn samples_mut(picture: &mut Picture) -> Result<SamplesMut<'_>> {
    let width = picture.width() as usize;
    let stride = row_stride(picture);
    let color = picture.color();
    let supported = match color {
        ColorType::Rgba16 => stride == width * 8,
        ColorType::Rgba8 => stride == width * 4,
        _ => false,
    };
    if !supported {
        return Err(unsupported(picture));
    }
    match picture {
        DynamicImage::ImageRgba16(buf) => Ok(SamplesMut::Sixteen(&mut **buf)),
        DynamicImage::ImageRgba8(buf) => Ok(SamplesMut::Eight(&mut **buf)),
        _ => Err(Error::UnsupportedDepth(format!("{:?}", color))),
    }
}

pub fn ensure_same_shape(expected: &Picture, actual: &Picture, what: &str) -> Result<()> {
    if expected.width() != actual.width()
        || expected.height() != actual.height()
        || expected.color() != actual.color()
    {
        return Err(Error::mismatch(format!(
            "{what}: expected {}x{} {:?}, got {}x{} {:?}",
            expected.width(),
            expected.height(),
            expected.color(),
            actual.width(),
            actual.height(),
            actual.color()
        )));
    }
    Ok(())
}

/// Decodes a frame and normalizes it to RGBA8 or RGBA16.
pub fn load(path: &Path) -> Result<Picture> {
    let decoded = image::open(path).map_err(|e| Error::image(path, e))?;
    normalize(decoded)
}

pub fn normalize(picture: DynamicImage) -> Result<Picture> {
    match picture.color() {
        ColorType::Rgba8 | ColorType::Rgba16 => Ok(picture),
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 => {
            Ok(DynamicImage::ImageRgba16(picture.to_rgba16()))
        }
        ColorType::L8 | ColorType::La8 | ColorType::Rgb8 => {
            Ok(DynamicImage::ImageRgba8(picture.to_rgba8()))
        }
        other => Err(Error::UnsupportedDepth(format!("{:?}", other))),
    }
}

pub fn output_path(dir: &Path, output_index: u64) -> PathBuf {
    dir.join(format!("{:08}.png", output_index))
}

/// Writes a PNG through a temporary sibling file so readers never observe a
/// partially written frame.
pub fn save_png_atomic(picture: &Picture, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".fieldmend-")
        .suffix(".part")
        .tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        picture
            .write_to(&mut writer, ImageFormat::Png)
            .map_err(|e| Error::image(path, e))?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use image::{ImageBuffer, Rgba, RgbaImage};

    pub fn rgba8(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 4]) -> Picture {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| Rgba(f(x, y))))
    }

    pub fn rgba16(width: u32, height: u32, f: impl Fn(u32, u32) -> [u16; 4]) -> Picture {
        DynamicImage::ImageRgba16(ImageBuffer::from_fn(width, height, |x, y| Rgba(f(x, y))))
    }

    pub fn solid8(width: u32, height: u32, v: u8) -> Picture {
        rgba8(width, height, |_, _| [v, v, v, 255])
    }

    pub fn row8(picture: &Picture, y: u32) -> Vec<u8> {
        let width = picture.width() as usize;
        let bytes = picture.as_bytes();
        let start = y as usize * width * CHANNELS;
        bytes[start..start + width * CHANNELS].to_vec()
    }
}
