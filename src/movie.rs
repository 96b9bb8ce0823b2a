use crate::error::{Error, Result};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

const FRAME_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[value(rename_all = "PascalCase")]
pub enum FrameAction {
    Discard,
    #[default]
    Unknown,
    TopFieldFirst,
    BottomFieldFirst,
    TopFieldOnly,
    BottomFieldOnly,
    Progressive,
    Average,
    Duplicate,
    Triplicate,
    Replace,
    Deblend,
    Interpolate,
}

impl FrameAction {
    pub fn name(self) -> &'static str {
        match self {
            FrameAction::Discard => "Discard",
            FrameAction::Unknown => "Unknown",
            FrameAction::TopFieldFirst => "TopFieldFirst",
            FrameAction::BottomFieldFirst => "BottomFieldFirst",
            FrameAction::TopFieldOnly => "TopFieldOnly",
            FrameAction::BottomFieldOnly => "BottomFieldOnly",
            FrameAction::Progressive => "Progressive",
            FrameAction::Average => "Average",
            FrameAction::Duplicate => "Duplicate",
            FrameAction::Triplicate => "Triplicate",
            FrameAction::Replace => "Replace",
            FrameAction::Deblend => "Deblend",
            FrameAction::Interpolate => "Interpolate",
        }
    }

    /// Token used in the legacy `.frames.txt` sidecar. Actions the legacy
    /// format cannot carry map to `None`.
    pub fn legacy_token(self) -> Option<&'static str> {
        match self {
            FrameAction::Discard
            | FrameAction::TopFieldFirst
            | FrameAction::BottomFieldFirst
            | FrameAction::TopFieldOnly
            | FrameAction::BottomFieldOnly
            | FrameAction::Progressive
            | FrameAction::Average
            | FrameAction::Duplicate
            | FrameAction::Triplicate => Some(self.name()),
            FrameAction::Unknown
            | FrameAction::Replace
            | FrameAction::Deblend
            | FrameAction::Interpolate => None,
        }
    }

    pub fn from_legacy_token(token: &str) -> Option<Self> {
        let action = token.parse::<FrameAction>().ok()?;
        action.legacy_token().map(|_| action)
    }

    /// Swaps top and bottom for the field-based actions.
    pub fn flipped(self) -> Self {
        match self {
            FrameAction::TopFieldFirst => FrameAction::BottomFieldFirst,
            FrameAction::BottomFieldFirst => FrameAction::TopFieldFirst,
            FrameAction::TopFieldOnly => FrameAction::BottomFieldOnly,
            FrameAction::BottomFieldOnly => FrameAction::TopFieldOnly,
            other => other,
        }
    }

    /// Number of output images a directly emitted frame produces.
    pub fn copies(self) -> u64 {
        match self {
            FrameAction::Discard => 0,
            FrameAction::Duplicate => 2,
            FrameAction::Triplicate => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for FrameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FrameAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        <FrameAction as ValueEnum>::from_str(s.trim(), true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub index: usize,
    pub filename: String,
    #[serde(default)]
    pub action: FrameAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combedness: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolation_sources: Option<(usize, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub also_insert_interpolated_after: Option<bool>,
}

impl Frame {
    pub fn new(index: usize, filename: impl Into<String>) -> Self {
        Self {
            index,
            filename: filename.into(),
            action: FrameAction::Unknown,
            combedness: None,
            replacement_index: None,
            interpolation_sources: None,
            also_insert_interpolated_after: None,
        }
    }

    pub fn interpolate_after(&self) -> bool {
        self.also_insert_interpolated_after.unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Movie {
    dir: PathBuf,
    frames: Vec<Frame>,
}

impl Movie {
    /// Ingests every frame image directly inside `dir`, ordered by file name.
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Movie(format!("{} is not a directory", dir.display())));
        }

        let mut frames = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::Movie(e.to_string()))?;
            if !entry.file_type().is_file() || !is_frame_file(entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            frames.push(Frame::new(frames.len(), name));
        }

        Ok(Self::from_frames(dir.to_path_buf(), frames))
    }

    pub fn from_frames(dir: PathBuf, frames: Vec<Frame>) -> Self {
        Self { dir, frames }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub fn frame_path(&self, index: usize) -> Option<PathBuf> {
        self.frames.get(index).map(|f| self.dir.join(&f.filename))
    }

    /// Sets a frame's action, checking the payload each action requires.
    pub fn retag(&mut self, index: usize, tag: Tag) -> Result<()> {
        let len = self.frames.len();
        let frame = self
            .frames
            .get_mut(index)
            .ok_or_else(|| Error::invalid_tag(index, format!("no such frame (movie has {len})")))?;

        match tag.action {
            FrameAction::Replace => {
                let target = tag
                    .replacement_index
                    .ok_or_else(|| Error::invalid_tag(index, "Replace needs a replacement index"))?;
                if target >= len {
                    return Err(Error::invalid_tag(index, format!("replacement {target} out of range")));
                }
            }
            FrameAction::Interpolate => {
                let (a, b) = tag
                    .interpolation_sources
                    .ok_or_else(|| Error::invalid_tag(index, "Interpolate needs two source frames"))?;
                if a >= len || b >= len {
                    return Err(Error::invalid_tag(index, format!("sources {a},{b} out of range")));
                }
            }
            _ => {}
        }

        frame.action = tag.action;
        frame.replacement_index = tag.replacement_index;
        frame.interpolation_sources = tag.interpolation_sources;
        if tag.also_insert_interpolated_after.is_some() {
            frame.also_insert_interpolated_after = tag.also_insert_interpolated_after;
        }
        Ok(())
    }

    /// Checks the per-action invariants over the whole sequence.
    pub fn validate(&self) -> Result<()> {
        let len = self.frames.len();
        for f in &self.frames {
            match f.action {
                FrameAction::Replace => match f.replacement_index {
                    Some(r) if r < len => {}
                    Some(r) => return Err(Error::invalid_tag(f.index, format!("replacement {r} out of range"))),
                    None => return Err(Error::invalid_tag(f.index, "Replace without replacement index")),
                },
                FrameAction::Interpolate => match f.interpolation_sources {
                    Some((a, b)) if a < len && b < len => {}
                    Some((a, b)) => {
                        return Err(Error::invalid_tag(f.index, format!("sources {a},{b} out of range")))
                    }
                    None => return Err(Error::invalid_tag(f.index, "Interpolate without sources")),
                },
                _ => {}
            }
        }
        Ok(())
    }

    /// `/movies/reel1/` -> `/movies/reel1.frames.txt`
    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_path_with(&self.dir, ".frames.txt")
    }

    pub fn project_path(&self) -> PathBuf {
        sidecar_path_with(&self.dir, ".frames.json")
    }

    /// Applies a legacy sidecar. Returns one warning per line that could not
    /// be fully understood; unreadable fields are left unset.
    pub fn apply_legacy_tags(&mut self, text: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split(',').map(str::trim);
            let index = match fields.next().map(str::parse::<usize>) {
                Some(Ok(i)) => i,
                _ => {
                    warnings.push(format!("line {}: unreadable frame index {:?}", line_no + 1, line));
                    continue;
                }
            };
            let Some(frame) = self.frames.get_mut(index) else {
                warnings.push(format!("line {}: frame {} not in directory", line_no + 1, index));
                continue;
            };

            if let Some(raw) = fields.next().filter(|s| !s.is_empty()) {
                match raw.parse::<f32>() {
                    Ok(v) => frame.combedness = Some(v),
                    Err(_) => warnings.push(format!("line {}: bad combedness {:?}", line_no + 1, raw)),
                }
            }

            if let Some(token) = fields.next().filter(|s| !s.is_empty()) {
                match FrameAction::from_legacy_token(token) {
                    Some(action) => frame.action = action,
                    None => warnings.push(format!("line {}: unknown action {:?}", line_no + 1, token)),
                }
            }
        }
        warnings
    }

    pub fn legacy_tags(&self) -> String {
        let mut out = String::new();
        for f in &self.frames {
            let combed = f.combedness.map(|c| c.to_string()).unwrap_or_default();
            let token = f.action.legacy_token().unwrap_or("");
            out.push_str(&format!("{},{},{}\n", f.index, combed, token));
        }
        out
    }

    #[cfg(test)]
    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }
}

/// Requested retag of one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tag {
    pub action: FrameAction,
    pub replacement_index: Option<usize>,
    pub interpolation_sources: Option<(usize, usize)>,
    pub also_insert_interpolated_after: Option<bool>,
}

impl Tag {
    pub fn action(action: FrameAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }
}

fn sidecar_path_with(dir: &Path, suffix: &str) -> PathBuf {
    let raw = dir.to_string_lossy();
    let trimmed = raw.trim_end_matches(['/', std::path::MAIN_SEPARATOR]);
    let base = if trimmed.is_empty() { raw.as_ref() } else { trimmed };
    PathBuf::from(format!("{}{}", base, suffix))
}

fn is_frame_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .map(|e| FRAME_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}
