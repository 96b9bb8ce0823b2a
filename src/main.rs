mod analysis;
mod average;
mod backend;
mod deinterlace;
mod error;
mod interpolate;
mod movie;
mod picture;
mod progress;
mod project;
mod render;
mod util;
mod yadif;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, RecvTimeoutError};
use deinterlace::ReconstructorKind;
use interpolate::InterpolatorKind;
use movie::{FrameAction, Movie, Tag};
use progress::{ProgressConfig, ProgressMode, ProgressOutcome, ProgressReporter};
use render::{CancelToken, RenderOptions, RenderProgress, RenderSummary, Renderer};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "fieldmend",
    version,
    about = "Restore telecined or damaged frame sequences from per-frame tags"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a tagged frame directory into a renumbered PNG sequence
    Render {
        frames_dir: PathBuf,
        output_dir: PathBuf,

        /// Field reconstruction: basic, yadif (spatio-temporal) or ffmpeg.
        #[arg(long, value_enum, default_value_t = ReconstructorKind::Yadif)]
        reconstructor: ReconstructorKind,

        /// Keep the yadif temporal window at the motion estimate instead of
        /// widening it with rows two lines away.
        #[arg(long, default_value_t = false)]
        no_spatial_check: bool,

        /// Frame interpolation: none, blend or external.
        #[arg(long, value_enum, default_value_t = InterpolatorKind::None)]
        interpolator: InterpolatorKind,

        /// Command template for the external interpolator; {prior}, {after} and {output} are replaced with PNG paths.
        #[arg(long)]
        interpolator_cmd: Option<String>,

        /// Swap top and bottom for every field action.
        #[arg(long, default_value_t = false)]
        flip_fields: bool,

        /// Only write output for input frames in START..END.
        #[arg(long, value_parser = util::parse_range)]
        input_range: Option<Range<u64>>,

        /// Only write output indices in START..END.
        #[arg(long, value_parser = util::parse_range)]
        output_range: Option<Range<u64>>,

        /// Emit one image per averaging run instead of one per averaged frame.
        #[arg(long, default_value_t = false)]
        collapse_averages: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Print the tag table of a frame directory
    List { frames_dir: PathBuf },

    /// Retag one frame (N) or a range of frames (A..B) and save the tags
    Tag {
        frames_dir: PathBuf,
        selection: String,

        #[arg(value_enum, ignore_case = true)]
        action: FrameAction,

        /// Frame whose image a Replace frame shows.
        #[arg(long)]
        replace_with: Option<usize>,

        /// Source frames for Interpolate, as A,B.
        #[arg(long)]
        sources: Option<String>,

        /// Also emit an interpolated frame between this frame and the next.
        #[arg(long)]
        interpolate_after: Option<bool>,
    },

    /// Score every frame for combing and optionally tag the combed ones
    Analyze {
        frames_dir: PathBuf,

        /// Score at or above which untagged frames receive --tag-as.
        #[arg(long, requires = "tag_as")]
        threshold: Option<f32>,

        #[arg(long, value_enum, ignore_case = true, requires = "threshold")]
        tag_as: Option<FrameAction>,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },
}

struct RenderJob {
    frames_dir: PathBuf,
    output_dir: PathBuf,
    reconstructor: ReconstructorKind,
    spatial_check: bool,
    interpolator: InterpolatorKind,
    interpolator_cmd: Option<String>,
    options: RenderOptions,
    progress: ProgressConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Render {
            frames_dir,
            output_dir,
            reconstructor,
            no_spatial_check,
            interpolator,
            interpolator_cmd,
            flip_fields,
            input_range,
            output_range,
            collapse_averages,
            progress,
        } => {
            let job = RenderJob {
                frames_dir,
                output_dir,
                reconstructor,
                spatial_check: !no_spatial_check,
                interpolator,
                interpolator_cmd,
                options: RenderOptions {
                    flip_fields,
                    input_range: input_range.map(to_index_range),
                    output_range,
                    collapse_average_runs: collapse_averages,
                },
                progress: ProgressConfig::new(progress),
            };
            let (summary, outcome) = run_render(job)?;
            print_render_summary(&summary, &outcome);
        }

        Commands::List { frames_dir } => {
            let movie = open_tagged(&frames_dir, |w| eprintln!("[WARN] list: {}", w))?;
            print_tag_table(&movie);
        }

        Commands::Tag {
            frames_dir,
            selection,
            action,
            replace_with,
            sources,
            interpolate_after,
        } => {
            let mut movie = open_tagged(&frames_dir, |w| eprintln!("[WARN] tag: {}", w))?;
            let frames = util::parse_frame_selection(&selection, movie.len())?;
            let tag = Tag {
                action,
                replacement_index: replace_with,
                interpolation_sources: sources.as_deref().map(util::parse_pair).transpose()?,
                also_insert_interpolated_after: interpolate_after,
            };
            for index in frames.clone() {
                movie
                    .retag(index, tag)
                    .with_context(|| format!("failed to tag frame {}", index))?;
            }
            project::save_tags(&movie).context("failed to save tags")?;
            println!(
                "Tagged frames {}..{} as {} in {}",
                frames.start,
                frames.end,
                action,
                movie.project_path().display()
            );
        }

        Commands::Analyze {
            frames_dir,
            threshold,
            tag_as,
            progress,
        } => {
            let mut movie = open_tagged(&frames_dir, |w| eprintln!("[WARN] analyze: {}", w))?;
            let auto_tag = match (threshold, tag_as) {
                (Some(threshold), Some(action)) => Some(analysis::AutoTag { threshold, action }),
                (None, None) => None,
                _ => bail!("--threshold and --tag-as go together"),
            };

            let reporter = ProgressReporter::new(
                "analyze",
                movie.len() as u64,
                ProgressConfig::new(progress),
            );
            let handle = reporter.handle();
            handle.set_stage("scoring frames");
            let report = analysis::analyze_movie(&mut movie, auto_tag, |i, _| {
                handle.frames_done(i as u64 + 1)
            })
                .context("combedness analysis failed")?;
            project::save_tags(&movie).context("failed to save tags")?;
            let outcome = reporter.finish("analysis complete");

            println!(
                "Analyze summary: frames={} tagged={} max_combedness={:.4} duration={}",
                report.frames,
                report.tagged,
                report.max_score,
                util::fmt_duration(outcome.elapsed)
            );
        }
    }

    Ok(())
}

fn to_index_range(range: Range<u64>) -> Range<usize> {
    let clip = |v: u64| usize::try_from(v).unwrap_or(usize::MAX);
    clip(range.start)..clip(range.end)
}

fn open_tagged(frames_dir: &Path, mut warn: impl FnMut(&str)) -> Result<Movie> {
    let mut movie = Movie::open(frames_dir)
        .with_context(|| format!("failed to read frames from {:?}", frames_dir))?;
    let (_source, warnings) = project::load_tags(&mut movie)
        .with_context(|| format!("failed to load tags for {:?}", frames_dir))?;
    for w in &warnings {
        warn(w);
    }
    Ok(movie)
}

fn run_render(job: RenderJob) -> Result<(RenderSummary, ProgressOutcome)> {
    let mut movie = Movie::open(&job.frames_dir)
        .with_context(|| format!("failed to read frames from {:?}", job.frames_dir))?;
    if movie.is_empty() {
        bail!("no frames found in {:?}", job.frames_dir);
    }
    let (tag_source, tag_warnings) = project::load_tags(&mut movie)
        .with_context(|| format!("failed to load tags for {:?}", job.frames_dir))?;
    if job.reconstructor == ReconstructorKind::Ffmpeg {
        util::ensure_ffmpeg_available().context("ffmpeg not found in PATH")?;
    }
    let mut interpolator =
        interpolate::build_interpolator(job.interpolator, job.interpolator_cmd.as_deref())
            .context("failed to set up the interpolator")?;

    let frames_total = job
        .options
        .input_range
        .as_ref()
        .map_or(movie.len(), |r| r.end.min(movie.len())) as u64;
    let reporter = ProgressReporter::new("render", frames_total, job.progress);
    let handle = reporter.handle();
    let mut reconstructor = deinterlace::build_reconstructor(job.reconstructor, job.spatial_check);
    handle.log(format!(
        "{} frames, tags from {:?}, reconstructor={} interpolator={}",
        movie.len(),
        tag_source,
        reconstructor.name(),
        interpolator.name()
    ));
    for w in tag_warnings {
        handle.warning(w);
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .context("failed to install the Ctrl-C handler")?;
    }
    let progress = Arc::new(RenderProgress::new());
    let (done_tx, done_rx) = bounded::<Result<RenderSummary>>(1);

    handle.set_stage("rendering");
    let worker = {
        let progress = Arc::clone(&progress);
        let cancel = cancel.clone();
        let output_dir = job.output_dir.clone();
        let options = job.options.clone();
        std::thread::spawn(move || {
            let result = Renderer::new(&movie, reconstructor.as_mut(), options)
                .with_interpolator(interpolator.as_mut())
                .with_cancel_token(cancel)
                .with_progress(progress)
                .render(&output_dir);
            reconstructor.cool_down();
            let _ = done_tx.send(result.map_err(anyhow::Error::from));
        })
    };

    let mut cancel_noted = false;
    let result = loop {
        match done_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) => {
                handle.update(progress.counters());
                if cancel.is_cancelled() && !cancel_noted {
                    cancel_noted = true;
                    handle.set_stage("cancelling");
                    handle.log("interrupt received, stopping after the frame in progress");
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Err(anyhow!("render worker exited without a result"));
            }
        }
    };
    worker
        .join()
        .map_err(|_| anyhow!("render worker panicked"))?;
    handle.update(progress.counters());

    let summary = result.with_context(|| {
        format!(
            "render of {:?} into {:?} failed",
            job.frames_dir, job.output_dir
        )
    })?;
    for w in &summary.warnings {
        handle.warning(w.clone());
    }
    let outcome = reporter.finish(format!("render {}", summary.status.as_str()));
    Ok((summary, outcome))
}

fn print_render_summary(summary: &RenderSummary, outcome: &ProgressOutcome) {
    println!(
        "Render summary: status={} duration={} rate={:.2} fps frames={} / {} outputs_written={} next_output_index={} warnings={}",
        summary.status.as_str(),
        util::fmt_duration(summary.elapsed),
        outcome.avg_frames_per_sec,
        summary.frames_processed,
        summary.frames_total,
        summary.outputs_written,
        summary.next_output_index,
        outcome.warnings.len(),
    );
    for warning in &outcome.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_tag_table(movie: &Movie) {
    println!("{} frames in {}", movie.len(), movie.dir().display());
    for f in movie.frames() {
        let combed = f
            .combedness
            .map(|c| format!("{:.4}", c))
            .unwrap_or_else(|| "-".to_string());
        let mut extra = Vec::new();
        if let Some(r) = f.replacement_index {
            extra.push(format!("replace={}", r));
        }
        if let Some((a, b)) = f.interpolation_sources {
            extra.push(format!("sources={},{}", a, b));
        }
        if f.interpolate_after() {
            extra.push("interpolate-after".to_string());
        }
        println!(
            "{:>6} {:<28} {:<16} {:>8} {}",
            f.index,
            f.filename,
            f.action,
            combed,
            extra.join(" ")
        );
    }
}
