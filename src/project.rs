use crate::error::{Error, Result};
use crate::movie::{Frame, Movie};

use serde::{Deserialize, Serialize};
use std::fs;

pub const PROJECT_VERSION: u16 = 1;

/// Full tag set for a frame directory, including the actions the legacy
/// sidecar cannot express.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub version: u16,
    pub frame_count: usize,
    pub frames: Vec<Frame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    Project,
    Legacy,
    None,
}

/// Loads tags for a freshly ingested movie. The JSON project file wins over
/// the legacy sidecar when both exist.
pub fn load_tags(movie: &mut Movie) -> Result<(TagSource, Vec<String>)> {
    let project_path = movie.project_path();
    if project_path.is_file() {
        let text = fs::read_to_string(&project_path)?;
        let project: Project = serde_json::from_str(&text)?;
        let warnings = apply_project(movie, project)?;
        return Ok((TagSource::Project, warnings));
    }

    let legacy_path = movie.sidecar_path();
    if legacy_path.is_file() {
        let text = fs::read_to_string(&legacy_path)?;
        let warnings = movie.apply_legacy_tags(&text);
        return Ok((TagSource::Legacy, warnings));
    }

    Ok((TagSource::None, Vec::new()))
}

fn apply_project(movie: &mut Movie, project: Project) -> Result<Vec<String>> {
    if project.version > PROJECT_VERSION {
        return Err(Error::Movie(format!(
            "project version {} is newer than supported {}",
            project.version, PROJECT_VERSION
        )));
    }

    let mut warnings = Vec::new();
    if project.frame_count != movie.len() {
        warnings.push(format!(
            "project lists {} frames, directory has {}",
            project.frame_count,
            movie.len()
        ));
    }

    for stored in project.frames {
        let Some(frame) = movie.frame_mut(stored.index) else {
            warnings.push(format!("frame {} not in directory", stored.index));
            continue;
        };
        if frame.filename != stored.filename {
            warnings.push(format!(
                "frame {} is {} on disk but {} in project",
                stored.index, frame.filename, stored.filename
            ));
        }
        frame.action = stored.action;
        frame.combedness = stored.combedness;
        frame.replacement_index = stored.replacement_index;
        frame.interpolation_sources = stored.interpolation_sources;
        frame.also_insert_interpolated_after = stored.also_insert_interpolated_after;
    }
    Ok(warnings)
}

/// Writes both the project file and the legacy sidecar.
pub fn save_tags(movie: &Movie) -> Result<()> {
    let project = Project {
        version: PROJECT_VERSION,
        frame_count: movie.len(),
        frames: movie.frames().to_vec(),
    };
    let json = serde_json::to_string_pretty(&project)?;
    fs::write(movie.project_path(), json)?;
    fs::write(movie.sidecar_path(), movie.legacy_tags())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movie::{FrameAction, Tag};
    use tempfile::TempDir;

    fn movie_in(tmp: &TempDir, n: usize) -> Movie {
        let dir = tmp.path().join("reel");
        fs::create_dir_all(&dir).expect("mkdir");
        for i in 0..n {
            fs::write(dir.join(format!("{:04}.png", i)), b"x").expect("write");
        }
        Movie::open(&dir).expect("open")
    }

    #[test]
    fn project_keeps_actions_the_legacy_file_drops() {
        let tmp = TempDir::new().expect("tempdir");
        let mut movie = movie_in(&tmp, 4);
        movie
            .retag(
                1,
                Tag {
                    action: FrameAction::Interpolate,
                    interpolation_sources: Some((0, 2)),
                    also_insert_interpolated_after: Some(true),
                    ..Tag::default()
                },
            )
            .expect("retag");
        movie.retag(2, Tag::action(FrameAction::Triplicate)).expect("retag");
        save_tags(&movie).expect("save");

        let mut reloaded = movie_in(&tmp, 4);
        let (source, warnings) = load_tags(&mut reloaded).expect("load");
        assert_eq!(source, TagSource::Project);
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(reloaded.frames(), movie.frames());

        fs::remove_file(reloaded.project_path()).expect("remove project");
        let mut legacy_only = movie_in(&tmp, 4);
        let (source, _) = load_tags(&mut legacy_only).expect("load legacy");
        assert_eq!(source, TagSource::Legacy);
        assert_eq!(legacy_only.frames()[1].action, FrameAction::Unknown);
        assert_eq!(legacy_only.frames()[2].action, FrameAction::Triplicate);
    }

    #[test]
    fn untagged_directory_reports_no_source() {
        let tmp = TempDir::new().expect("tempdir");
        let mut movie = movie_in(&tmp, 2);
        let (source, warnings) = load_tags(&mut movie).expect("load");
        assert_eq!(source, TagSource::None);
        assert!(warnings.is_empty());
    }
}
