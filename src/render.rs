use crate::average;
use crate::deinterlace::{FieldMode, FieldReconstructor};
use crate::error::{Error, Result};
use crate::interpolate::FrameInterpolator;
use crate::movie::{FrameAction, Movie};
use crate::picture::{self, Picture};
use crate::progress::FrameCounters;

use std::collections::VecDeque;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Groups closer than this to a requested range are rendered, not skipped.
const LOOKAHEAD: usize = 2;
const WINDOW_FRAMES: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub flip_fields: bool,
    /// Input frame indices whose emissions are written.
    pub input_range: Option<Range<usize>>,
    /// Output indices that are written.
    pub output_range: Option<Range<u64>>,
    pub collapse_average_runs: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters a running pass publishes for another thread to poll.
#[derive(Debug, Default)]
pub struct RenderProgress {
    frames_done: AtomicU64,
    outputs_written: AtomicU64,
    next_output_index: AtomicU64,
}

impl RenderProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> FrameCounters {
        FrameCounters {
            frames_done: self.frames_done.load(Ordering::Relaxed),
            outputs_written: self.outputs_written.load(Ordering::Relaxed),
            next_output_index: self.next_output_index.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Completed,
    Cancelled,
}

impl RenderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderStatus::Completed => "completed",
            RenderStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSummary {
    pub status: RenderStatus,
    pub frames_processed: u64,
    pub frames_total: u64,
    pub outputs_written: u64,
    pub next_output_index: u64,
    pub elapsed: Duration,
    pub warnings: Vec<String>,
}

/// A standalone frame, or an averaging run made of the frame before it (when
/// that frame can take part) plus the contiguous `Average` frames. What a
/// group emits depends only on tags, options and interpolator capability, so
/// skipping one without touching pixels keeps numbering identical.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Group {
    Single(usize),
    /// `pre` is merged into the run and supplies the averaging target.
    Run {
        pre: Option<usize>,
        members: Range<usize>,
    },
}

impl Group {
    fn first(&self) -> usize {
        match self {
            Group::Single(i) => *i,
            Group::Run { pre, members } => pre.unwrap_or(members.start),
        }
    }

    fn last(&self) -> usize {
        match self {
            Group::Single(i) => *i,
            Group::Run { members, .. } => members.end - 1,
        }
    }

    fn frame_count(&self) -> u64 {
        (self.last() + 1 - self.first()) as u64
    }
}

fn plan(actions: &[FrameAction]) -> Vec<Group> {
    let run_end = |from: usize| {
        (from..actions.len())
            .find(|&j| actions[j] != FrameAction::Average)
            .unwrap_or(actions.len())
    };

    let mut groups = Vec::new();
    let mut i = 0;
    while i < actions.len() {
        let next_is_average = actions.get(i + 1) == Some(&FrameAction::Average);
        if actions[i] == FrameAction::Average {
            let end = run_end(i);
            groups.push(Group::Run {
                pre: None,
                members: i..end,
            });
            i = end;
        } else if actions[i] != FrameAction::Discard && next_is_average {
            let end = run_end(i + 1);
            groups.push(Group::Run {
                pre: Some(i),
                members: i + 1..end,
            });
            i = end;
        } else {
            groups.push(Group::Single(i));
            i += 1;
        }
    }
    groups
}

/// Small most-recently-used set of decoded input frames.
struct FrameWindow {
    entries: VecDeque<(usize, Arc<Picture>)>,
}

impl FrameWindow {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(WINDOW_FRAMES + 1),
        }
    }

    fn get_or_load(&mut self, movie: &Movie, index: usize) -> Result<Arc<Picture>> {
        if let Some(pos) = self.entries.iter().position(|(i, _)| *i == index) {
            if let Some(entry) = self.entries.remove(pos) {
                let picture = Arc::clone(&entry.1);
                self.entries.push_back(entry);
                return Ok(picture);
            }
        }

        let path = movie
            .frame_path(index)
            .ok_or_else(|| Error::Movie(format!("frame {} not in movie", index)))?;
        let picture = Arc::new(picture::load(&path)?);
        self.entries.push_back((index, Arc::clone(&picture)));
        while self.entries.len() > WINDOW_FRAMES {
            self.entries.pop_front();
        }
        Ok(picture)
    }
}

pub struct Renderer<'a> {
    movie: &'a Movie,
    reconstructor: &'a mut dyn FieldReconstructor,
    interpolator: Option<&'a mut dyn FrameInterpolator>,
    options: RenderOptions,
    cancel: CancelToken,
    progress: Arc<RenderProgress>,
    actions: Vec<FrameAction>,
    window: FrameWindow,
    last_interpolation: Option<((usize, usize), Arc<Picture>)>,
    output_index: u64,
    outputs_written: u64,
    frames_processed: u64,
    warnings: Vec<String>,
}

impl<'a> Renderer<'a> {
    pub fn new(
        movie: &'a Movie,
        reconstructor: &'a mut dyn FieldReconstructor,
        options: RenderOptions,
    ) -> Self {
        let actions = movie
            .frames()
            .iter()
            .map(|f| {
                if options.flip_fields {
                    f.action.flipped()
                } else {
                    f.action
                }
            })
            .collect();
        Self {
            movie,
            reconstructor,
            interpolator: None,
            options,
            cancel: CancelToken::new(),
            progress: Arc::new(RenderProgress::new()),
            actions,
            window: FrameWindow::new(),
            last_interpolation: None,
            output_index: 0,
            outputs_written: 0,
            frames_processed: 0,
            warnings: Vec::new(),
        }
    }

    pub fn with_interpolator(mut self, interpolator: &'a mut dyn FrameInterpolator) -> Self {
        self.interpolator = Some(interpolator);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<RenderProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Number of input frames a full pass covers under the current options.
    pub fn frames_total(&self) -> u64 {
        self.input_end() as u64
    }

    pub fn render(&mut self, out_dir: &Path) -> Result<RenderSummary> {
        let started = Instant::now();
        self.movie.validate()?;
        fs::create_dir_all(out_dir)?;
        self.reconstructor.warm_up()?;

        let groups = plan(&self.actions[..self.input_end()]);
        let status = match self.render_groups(&groups, out_dir) {
            Ok(()) => RenderStatus::Completed,
            Err(Error::Cancelled) => RenderStatus::Cancelled,
            // Children sharing the terminal's process group die on the same interrupt.
            Err(e) if self.cancel.is_cancelled() => {
                self.warnings.push(format!("frame in progress abandoned: {}", e));
                RenderStatus::Cancelled
            }
            Err(e) => return Err(e),
        };

        Ok(RenderSummary {
            status,
            frames_processed: self.frames_processed,
            frames_total: self.frames_total(),
            outputs_written: self.outputs_written,
            next_output_index: self.output_index,
            elapsed: started.elapsed(),
            warnings: self.warnings.clone(),
        })
    }

    fn input_end(&self) -> usize {
        let len = self.movie.len();
        self.options
            .input_range
            .as_ref()
            .map_or(len, |r| r.end.min(len))
    }

    fn render_groups(&mut self, groups: &[Group], out_dir: &Path) -> Result<()> {
        for group in groups {
            if self.output_exhausted() {
                break;
            }
            self.check_cancel()?;

            let count = self.emission_count(group);
            if self.can_skip(group, count) {
                self.output_index += count;
                self.progress
                    .next_output_index
                    .store(self.output_index, Ordering::Relaxed);
                self.mark_done(group.frame_count());
                continue;
            }

            match group {
                Group::Single(i) => self.render_single(*i, out_dir)?,
                Group::Run { pre, members } => {
                    self.render_run(*pre, members.clone(), count, out_dir)?
                }
            }
        }
        Ok(())
    }

    /// Images a group emits. Shared by the skip path and the render path.
    fn emission_count(&self, group: &Group) -> u64 {
        match group {
            Group::Single(i) => {
                let action = self.actions[*i];
                action.copies() + u64::from(self.interpolates_after(*i, action))
            }
            Group::Run { .. } if self.options.collapse_average_runs => 1,
            Group::Run { pre, members } => {
                let pre_copies = pre.map_or(0, |p| self.actions[p].copies());
                pre_copies + members.len() as u64
            }
        }
    }

    fn can_skip(&self, group: &Group, count: u64) -> bool {
        let input_ahead = self
            .options
            .input_range
            .as_ref()
            .map(|r| group.last() + LOOKAHEAD < r.start);
        let output_ahead = self
            .options
            .output_range
            .as_ref()
            .map(|r| self.output_index + count + LOOKAHEAD as u64 <= r.start);
        match (input_ahead, output_ahead) {
            (None, None) => false,
            (a, b) => a.unwrap_or(true) && b.unwrap_or(true),
        }
    }

    fn output_exhausted(&self) -> bool {
        self.options
            .output_range
            .as_ref()
            .is_some_and(|r| self.output_index >= r.end)
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn mark_done(&mut self, frames: u64) {
        self.frames_processed += frames;
        self.progress.frames_done.fetch_add(frames, Ordering::Relaxed);
    }

    fn can_interpolate(&self) -> bool {
        self.interpolator
            .as_ref()
            .is_some_and(|i| i.can_interpolate_middle_frame())
    }

    fn interpolates_after(&self, index: usize, action: FrameAction) -> bool {
        action != FrameAction::Discard
            && self.movie.frames()[index].interpolate_after()
            && index + 1 < self.movie.len()
            && self.can_interpolate()
    }

    /// File a frame's pixels come from, following `Replace`.
    fn source_index(&self, index: usize) -> usize {
        match self.actions[index] {
            FrameAction::Replace => self.movie.frames()[index]
                .replacement_index
                .unwrap_or(index),
            _ => index,
        }
    }

    fn load(&mut self, index: usize) -> Result<Arc<Picture>> {
        self.window.get_or_load(self.movie, index)
    }

    fn render_single(&mut self, index: usize, out_dir: &Path) -> Result<()> {
        let action = self.actions[index];
        if action == FrameAction::Discard {
            self.mark_done(1);
            return Ok(());
        }

        let image = self.process(index, action)?;
        for _ in 0..action.copies() {
            self.emit(&image, index, out_dir)?;
        }
        if self.interpolates_after(index, action) {
            let next = self.load(self.source_index(index + 1))?;
            let middle = self.run_interpolator(&image, &next)?;
            self.emit(&middle, index, out_dir)?;
        }
        self.mark_done(1);
        Ok(())
    }

    fn render_run(
        &mut self,
        pre: Option<usize>,
        members: Range<usize>,
        count: u64,
        out_dir: &Path,
    ) -> Result<()> {
        let (target, rest) = match pre {
            Some(p) => (self.process(p, self.actions[p])?, members.clone()),
            None => (self.load(members.start)?, members.start + 1..members.end),
        };

        let mut others = Vec::with_capacity(rest.len());
        for m in rest {
            self.check_cancel()?;
            others.push(self.load(m)?);
        }

        let mut image = Arc::try_unwrap(target).unwrap_or_else(|shared| (*shared).clone());
        average::average(&mut image, &others)?;

        let last = members.end - 1;
        for _ in 0..count {
            self.emit(&image, last, out_dir)?;
        }
        self.mark_done(u64::from(pre.is_some()) + members.len() as u64);
        Ok(())
    }

    /// Pixels for one frame after its action is applied.
    fn process(&mut self, index: usize, action: FrameAction) -> Result<Arc<Picture>> {
        if action == FrameAction::Interpolate {
            return self.interpolate_sources(index);
        }

        let current = self.load(self.source_index(index))?;
        let Some(mode) = FieldMode::from_action(action) else {
            return Ok(current);
        };

        let prior = if mode.uses_neighbor() && self.reconstructor.needs_prior_frame() && index > 0 {
            Some(self.load(self.source_index(index - 1))?)
        } else {
            None
        };
        let next = if mode.uses_neighbor()
            && self.reconstructor.needs_next_frame()
            && index + 1 < self.movie.len()
        {
            Some(self.load(self.source_index(index + 1))?)
        } else {
            None
        };

        self.reconstructor.set_prior_frame(prior);
        self.reconstructor.set_next_frame(next);
        let mut image = (*current).clone();
        let result = self.reconstructor.reconstruct(&mut image, mode);
        self.reconstructor.set_prior_frame(None);
        self.reconstructor.set_next_frame(None);
        result?;
        Ok(Arc::new(image))
    }

    fn interpolate_sources(&mut self, index: usize) -> Result<Arc<Picture>> {
        let Some(sources) = self.movie.frames()[index].interpolation_sources else {
            return Err(Error::invalid_tag(index, "Interpolate without sources"));
        };
        if let Some((key, image)) = &self.last_interpolation {
            if *key == sources {
                return Ok(Arc::clone(image));
            }
        }
        if !self.can_interpolate() {
            self.warnings.push(format!(
                "frame {}: no interpolator available, original image kept",
                index
            ));
            return self.load(index);
        }

        let prior = self.load(sources.0)?;
        let after = self.load(sources.1)?;
        let image = Arc::new(self.run_interpolator(&prior, &after)?);
        self.last_interpolation = Some((sources, Arc::clone(&image)));
        Ok(image)
    }

    fn run_interpolator(&mut self, prior: &Picture, after: &Picture) -> Result<Picture> {
        match self.interpolator.as_deref_mut() {
            Some(interpolator) => interpolator.interpolate(prior, after),
            None => Err(Error::Interpolation("no interpolator selected".to_string())),
        }
    }

    fn emit(&mut self, image: &Picture, frame: usize, out_dir: &Path) -> Result<()> {
        let index = self.output_index;
        self.output_index += 1;
        self.progress
            .next_output_index
            .store(self.output_index, Ordering::Relaxed);

        let output_ok = self
            .options
            .output_range
            .as_ref()
            .map_or(true, |r| r.contains(&index));
        let input_ok = self
            .options
            .input_range
            .as_ref()
            .map_or(true, |r| r.contains(&frame));
        if output_ok && input_ok {
            picture::save_png_atomic(image, &picture::output_path(out_dir, index))?;
            self.outputs_written += 1;
            self.progress.outputs_written.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
