use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::util::fmt_duration;

const MAX_STORED_WARNINGS: usize = 32;
const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Display {
    Bar,
    Lines,
    Silent,
}

impl ProgressMode {
    fn display(self, stderr_is_tty: bool) -> Display {
        match self {
            ProgressMode::Auto if stderr_is_tty => Display::Bar,
            ProgressMode::Auto | ProgressMode::Plain => Display::Lines,
            ProgressMode::Rich => Display::Bar,
            ProgressMode::Quiet => Display::Silent,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Warn once when the frame counter has not moved for this long.
    pub stall_after: Duration,
    /// Spacing of `[PROGRESS]` lines in plain mode.
    pub line_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            stall_after: Duration::from_secs(30),
            line_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    fn display(self) -> Display {
        self.mode.display(
            self.tty_override
                .unwrap_or_else(|| std::io::stderr().is_terminal()),
        )
    }
}

/// Position of a pass. Scans that write nothing leave the output fields at 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    pub frames_done: u64,
    pub outputs_written: u64,
    pub next_output_index: u64,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub counters: FrameCounters,
    pub avg_frames_per_sec: f64,
    pub warnings: Vec<String>,
}

/// Smoothed frames per second, resampled at most twice a second.
#[derive(Debug)]
struct RateMeter {
    sampled_at: Instant,
    sampled_frames: u64,
    fps: f64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            sampled_at: now,
            sampled_frames: 0,
            fps: 0.0,
        }
    }

    fn sample(&mut self, frames: u64, now: Instant) {
        let dt = now.duration_since(self.sampled_at).as_secs_f64();
        if dt < 0.5 {
            return;
        }
        let instant = frames.saturating_sub(self.sampled_frames) as f64 / dt;
        self.fps = if self.fps <= f64::EPSILON {
            instant
        } else {
            self.fps * 0.7 + instant * 0.3
        };
        self.sampled_at = now;
        self.sampled_frames = frames;
    }
}

struct State {
    started: Instant,
    stage: String,
    frames_total: u64,
    counters: FrameCounters,
    last_advance: Instant,
    last_line: Option<Instant>,
    stall_reported: bool,
    rate: RateMeter,
    warnings: Vec<String>,
}

impl State {
    fn fps(&self) -> f64 {
        if self.rate.fps > 0.01 {
            self.rate.fps
        } else {
            average_rate(self.counters.frames_done, self.started.elapsed())
        }
    }

    /// Everything but the frame position, which the bar draws itself.
    fn detail(&self) -> String {
        let mut text = String::new();
        if self.counters.next_output_index > 0 || self.counters.outputs_written > 0 {
            text.push_str(&format!(
                "out={} written={} ",
                self.counters.next_output_index, self.counters.outputs_written
            ));
        }
        let fps = self.fps();
        text.push_str(&format!(
            "rate={:.2} fps ETA={} stage={}",
            fps,
            eta(self.frames_total, self.counters.frames_done, fps)
                .map(fmt_duration)
                .unwrap_or_else(|| "--:--".to_string()),
            self.stage
        ));
        if !self.warnings.is_empty() {
            text.push_str(&format!(" warnings={}", self.warnings.len()));
        }
        text
    }

    fn line(&self, label: &str) -> String {
        format!(
            "[PROGRESS] {} elapsed={} frames={}/{} {}",
            label,
            fmt_duration(self.started.elapsed()),
            self.counters.frames_done,
            self.frames_total,
            self.detail()
        )
    }

    fn push_warning(&mut self, message: &str) {
        if self.warnings.len() >= MAX_STORED_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message.to_string());
    }
}

struct Shared {
    label: String,
    display: Display,
    config: ProgressConfig,
    bar: Option<ProgressBar>,
    state: Mutex<State>,
    stop: AtomicBool,
}

#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

/// Frame-count progress for one pass, drawn as an indicatif bar on a TTY and
/// as periodic `[PROGRESS]` lines otherwise.
pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, frames_total: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let display = config.display();
        let now = Instant::now();

        let bar = (display == Display::Bar).then(|| {
            let bar = ProgressBar::new(frames_total.max(1));
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {pos}/{len} frames | {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        });

        let shared = Arc::new(Shared {
            label,
            display,
            config,
            bar,
            state: Mutex::new(State {
                started: now,
                stage: "starting".to_string(),
                frames_total,
                counters: FrameCounters::default(),
                last_advance: now,
                last_line: None,
                stall_reported: false,
                rate: RateMeter::new(now),
                warnings: Vec::new(),
            }),
            stop: AtomicBool::new(false),
        });

        let ticker = (display != Display::Silent).then(|| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while !shared.stop.load(Ordering::Relaxed) {
                    thread::sleep(TICK);
                    shared.tick(Instant::now());
                }
            })
        });

        Self {
            handle: ProgressHandle { shared },
            ticker,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, final_message: impl Into<String>) -> ProgressOutcome {
        self.stop_ticker();
        let shared = &self.handle.shared;
        let final_message = final_message.into();

        let (outcome, line, detail) = {
            let state = shared.state.lock().unwrap();
            let elapsed = state.started.elapsed();
            let outcome = ProgressOutcome {
                elapsed,
                counters: state.counters,
                avg_frames_per_sec: average_rate(state.counters.frames_done, elapsed),
                warnings: state.warnings.clone(),
            };
            (outcome, state.line(&shared.label), state.detail())
        };

        match shared.display {
            Display::Silent => {}
            Display::Lines => {
                eprintln!("{}", line);
                eprintln!("[DONE] {}: {}", shared.label, final_message);
            }
            Display::Bar => {
                if let Some(bar) = &shared.bar {
                    bar.finish_with_message(format!("{} | {}", final_message, detail));
                }
            }
        }
        outcome
    }

    fn stop_ticker(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_ticker();
        if let Some(bar) = &self.handle.shared.bar {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        let line = {
            let mut state = self.shared.state.lock().unwrap();
            state.stage = stage;
            state.line(&self.shared.label)
        };
        match self.shared.display {
            Display::Lines => eprintln!("{}", line),
            Display::Bar => self.shared.redraw(),
            Display::Silent => {}
        }
    }

    /// Publishes the latest counters. The frame count never moves back.
    pub fn update(&self, counters: FrameCounters) {
        {
            let mut state = self.shared.state.lock().unwrap();
            let now = Instant::now();
            if counters.frames_done > state.counters.frames_done {
                state.last_advance = now;
                state.stall_reported = false;
            }
            let frames_done = counters.frames_done.max(state.counters.frames_done);
            state.counters = FrameCounters {
                frames_done,
                ..counters
            };
            state.rate.sample(frames_done, now);
        }
        self.shared.redraw();
    }

    pub fn frames_done(&self, frames_done: u64) {
        let counters = {
            let state = self.shared.state.lock().unwrap();
            FrameCounters {
                frames_done,
                ..state.counters
            }
        };
        self.update(counters);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.emit("INFO", &message.into());
    }

    /// Prints a warning and keeps it for the outcome.
    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.state.lock().unwrap().push_warning(&message);
        self.shared.emit("WARN", &message);
    }
}

impl Shared {
    fn tick(&self, now: Instant) {
        let (line, stall) = {
            let mut state = self.state.lock().unwrap();
            let done = state.counters.frames_done;
            state.rate.sample(done, now);

            let stall = stall_due(
                now,
                state.last_advance,
                self.config.stall_after,
                state.stall_reported,
                done,
                state.frames_total,
            );
            let stall = stall.then(|| {
                state.stall_reported = true;
                let msg = format!(
                    "no frame finished for {}s (stage={}, frame {})",
                    now.duration_since(state.last_advance).as_secs(),
                    state.stage,
                    done
                );
                state.push_warning(&msg);
                msg
            });

            let line_due = state
                .last_line
                .map_or(true, |at| now.duration_since(at) >= self.config.line_interval);
            let line = (self.display == Display::Lines && line_due).then(|| {
                state.last_line = Some(now);
                state.line(&self.label)
            });
            (line, stall)
        };

        if let Some(line) = line {
            eprintln!("{}", line);
        }
        self.redraw();
        if let Some(msg) = stall {
            self.emit("WARN", &msg);
        }
    }

    fn redraw(&self) {
        let Some(bar) = &self.bar else {
            return;
        };
        let state = self.state.lock().unwrap();
        bar.set_length(state.frames_total.max(1));
        bar.set_position(state.counters.frames_done);
        bar.set_message(state.detail());
    }

    fn emit(&self, level: &str, message: &str) {
        let text = format!("[{}] {}: {}", level, self.label, message);
        match (&self.display, &self.bar) {
            (Display::Silent, _) => {}
            (Display::Bar, Some(bar)) => bar.println(text),
            _ => eprintln!("{}", text),
        }
    }
}

fn average_rate(frames: u64, elapsed: Duration) -> f64 {
    frames as f64 / elapsed.as_secs_f64().max(1e-6)
}

fn eta(frames_total: u64, frames_done: u64, fps: f64) -> Option<Duration> {
    if fps <= 0.01 || frames_done >= frames_total {
        return None;
    }
    let remaining = (frames_total - frames_done) as f64;
    Some(Duration::from_secs_f64(remaining / fps))
}

fn stall_due(
    now: Instant,
    last_advance: Instant,
    threshold: Duration,
    already_reported: bool,
    frames_done: u64,
    frames_total: u64,
) -> bool {
    !already_reported
        && frames_done < frames_total
        && now.duration_since(last_advance) >= threshold
}
