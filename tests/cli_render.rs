use assert_cmd::Command;
use image::{Rgba, RgbaImage};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn ffmpeg_available() -> bool {
    std::process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn fieldmend() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("fieldmend"))
}

/// Frame `i` is a 16x12 picture whose red channel is `i * 20 + y`.
fn write_frames(root: &Path, count: usize) -> PathBuf {
    let dir = root.join("reel");
    fs::create_dir_all(&dir).expect("create frame dir");
    for i in 0..count {
        let img = RgbaImage::from_fn(16, 12, |x, y| {
            Rgba([(i as u32 * 20 + y) as u8, x as u8 * 8, 64, 255])
        });
        img.save(dir.join(format!("frame_{:04}.png", i)))
            .expect("write frame");
    }
    dir
}

fn write_legacy_tags(dir: &Path, lines: &[&str]) {
    let mut text = lines.join("\n");
    text.push('\n');
    fs::write(dir.with_extension("frames.txt"), text).expect("write legacy tags");
}

fn output_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read output dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

fn red_at(path: &Path, y: u32) -> u8 {
    image::open(path).expect("open output").to_rgba8().get_pixel(0, y)[0]
}

#[test]
fn render_help_lists_flags() {
    let output = fieldmend()
        .arg("render")
        .arg("--help")
        .output()
        .expect("render --help runs");
    assert!(output.status.success());
    let text = combined_output(&output);
    for flag in [
        "--reconstructor",
        "--no-spatial-check",
        "--interpolator",
        "--flip-fields",
        "--input-range",
        "--output-range",
        "--collapse-averages",
        "--progress",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn legacy_tags_drive_the_render() {
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 5);
    write_legacy_tags(
        &frames,
        &[
            "0,,Progressive",
            "1,0.42,TopFieldFirst",
            "2,,Discard",
            "3,,Duplicate",
            "4,,Progressive",
        ],
    );
    let out = tmp.path().join("out");

    let output = fieldmend()
        .arg("render")
        .arg(&frames)
        .arg(&out)
        .arg("--reconstructor")
        .arg("basic")
        .arg("--progress")
        .arg("plain")
        .output()
        .expect("render runs");
    let text = combined_output(&output);
    assert!(output.status.success(), "render failed: {text}");
    assert!(text.contains("Render summary:"), "missing summary: {text}");
    assert!(text.contains("status=completed"), "missing status: {text}");
    assert!(text.contains("outputs_written=5"), "wrong output count: {text}");

    assert_eq!(
        output_names(&out),
        vec![
            "00000000.png",
            "00000001.png",
            "00000002.png",
            "00000003.png",
            "00000004.png"
        ]
    );
    assert_eq!(red_at(&out.join("00000000.png"), 0), 0);
    // Odd rows of frame 1 come from frame 0.
    assert_eq!(red_at(&out.join("00000001.png"), 0), 20);
    assert_eq!(red_at(&out.join("00000001.png"), 1), 1);
    // Frame 2 is discarded and frame 3 is shown twice.
    assert_eq!(red_at(&out.join("00000002.png"), 0), 60);
    assert_eq!(red_at(&out.join("00000003.png"), 0), 60);
    assert_eq!(red_at(&out.join("00000004.png"), 0), 80);
}

#[test]
fn output_range_render_matches_full_render() {
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 8);
    write_legacy_tags(
        &frames,
        &[
            "0,,Triplicate",
            "1,,Average",
            "2,,Duplicate",
            "3,,Discard",
            "4,,Triplicate",
            "5,,TopFieldOnly",
            "6,,Duplicate",
            "7,,Progressive",
        ],
    );
    let full = tmp.path().join("full");
    let part = tmp.path().join("part");

    fieldmend()
        .arg("render")
        .arg(&frames)
        .arg(&full)
        .arg("--progress")
        .arg("quiet")
        .assert()
        .success();
    fieldmend()
        .arg("render")
        .arg(&frames)
        .arg(&part)
        .arg("--output-range")
        .arg("9..12")
        .arg("--progress")
        .arg("quiet")
        .assert()
        .success();

    assert_eq!(output_names(&full).len(), 13);
    assert_eq!(
        output_names(&part),
        vec!["00000009.png", "00000010.png", "00000011.png"]
    );
    for name in output_names(&part) {
        assert_eq!(
            fs::read(part.join(&name)).expect("read part"),
            fs::read(full.join(&name)).expect("read full"),
            "{name} differs"
        );
    }
}

#[test]
fn tag_then_list_round_trips_project_tags() {
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 4);

    fieldmend()
        .arg("tag")
        .arg(&frames)
        .arg("1..3")
        .arg("average")
        .assert()
        .success();
    fieldmend()
        .arg("tag")
        .arg(&frames)
        .arg("3")
        .arg("Replace")
        .arg("--replace-with")
        .arg("0")
        .assert()
        .success();

    assert!(frames.with_extension("frames.json").is_file());
    let legacy = fs::read_to_string(frames.with_extension("frames.txt")).expect("legacy file");
    assert!(legacy.contains("1,,Average"), "{legacy}");
    assert!(legacy.contains("3,,\n"), "{legacy}");

    let output = fieldmend().arg("list").arg(&frames).output().expect("list runs");
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("4 frames"), "{text}");
    assert!(text.contains("Replace"), "{text}");
    assert!(text.contains("replace=0"), "{text}");

    let out = tmp.path().join("out");
    fieldmend()
        .arg("render")
        .arg(&frames)
        .arg(&out)
        .arg("--collapse-averages")
        .arg("--progress")
        .arg("quiet")
        .assert()
        .success();
    // Frame 0 opens the run of 1 and 2; frame 3 shows frame 0 again.
    assert_eq!(output_names(&out), vec!["00000000.png", "00000001.png"]);
    assert_eq!(red_at(&out.join("00000000.png"), 0), 20);
    assert_eq!(red_at(&out.join("00000001.png"), 0), 0);
}

#[test]
fn tag_rejects_replace_without_target() {
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 2);
    let output = fieldmend()
        .arg("tag")
        .arg(&frames)
        .arg("0")
        .arg("Replace")
        .output()
        .expect("tag runs");
    assert!(!output.status.success());
    let text = combined_output(&output);
    assert!(text.contains("replacement index"), "{text}");
}

#[test]
fn analyze_scores_and_tags_combed_frames() {
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 2);
    let combed = RgbaImage::from_fn(16, 12, |_, y| {
        if y % 2 == 0 {
            Rgba([10, 10, 10, 255])
        } else {
            Rgba([220, 220, 220, 255])
        }
    });
    combed
        .save(frames.join("frame_0002.png"))
        .expect("write combed frame");

    let output = fieldmend()
        .arg("analyze")
        .arg(&frames)
        .arg("--threshold")
        .arg("0.5")
        .arg("--tag-as")
        .arg("TopFieldOnly")
        .arg("--progress")
        .arg("quiet")
        .output()
        .expect("analyze runs");
    let text = combined_output(&output);
    assert!(output.status.success(), "{text}");
    assert!(text.contains("tagged=1"), "{text}");

    let legacy = fs::read_to_string(frames.with_extension("frames.txt")).expect("legacy file");
    assert!(legacy.lines().any(|l| l.starts_with("2,") && l.ends_with(",TopFieldOnly")), "{legacy}");
}

#[test]
fn external_interpolator_requires_template() {
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 2);
    let output = fieldmend()
        .arg("render")
        .arg(&frames)
        .arg(tmp.path().join("out"))
        .arg("--interpolator")
        .arg("external")
        .arg("--progress")
        .arg("quiet")
        .output()
        .expect("render runs");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("command template"));
}

#[test]
fn ffmpeg_reconstructor_renders_field_frames() {
    if !ffmpeg_available() {
        return;
    }
    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 3);
    write_legacy_tags(&frames, &["0,,Progressive", "1,,TopFieldFirst", "2,,BottomFieldOnly"]);
    let out = tmp.path().join("out");

    let output = fieldmend()
        .arg("render")
        .arg(&frames)
        .arg(&out)
        .arg("--reconstructor")
        .arg("ffmpeg")
        .arg("--progress")
        .arg("plain")
        .output()
        .expect("render runs");
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(output_names(&out).len(), 3);
    let img = image::open(out.join("00000001.png")).expect("open output");
    assert_eq!((img.width(), img.height()), (16, 12));
}

#[cfg(unix)]
#[test]
fn interrupt_cancels_render_with_complete_files_only() {
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let tmp = TempDir::new().expect("tempdir");
    let frames = write_frames(tmp.path(), 12);
    fieldmend()
        .arg("tag")
        .arg(&frames)
        .arg("0..12")
        .arg("progressive")
        .arg("--interpolate-after")
        .arg("true")
        .assert()
        .success();

    // Each in-between frame takes a while, so the pass is still running when
    // the interrupt arrives.
    let script = tmp.path().join("slow_tween.sh");
    fs::write(&script, "sleep 0.3\ncp \"$2\" \"$3\"\n").expect("write script");
    let template = format!("sh {} {{prior}} {{after}} {{output}}", script.display());

    let out = tmp.path().join("out");
    let child = std::process::Command::new(assert_cmd::cargo::cargo_bin!("fieldmend"))
        .arg("render")
        .arg(&frames)
        .arg(&out)
        .arg("--interpolator")
        .arg("external")
        .arg("--interpolator-cmd")
        .arg(&template)
        .arg("--progress")
        .arg("plain")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn render");

    let deadline = Instant::now() + Duration::from_secs(30);
    while !out.join("00000000.png").is_file() {
        assert!(Instant::now() < deadline, "render never wrote its first frame");
        std::thread::sleep(Duration::from_millis(20));
    }
    let killed = std::process::Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .expect("run kill");
    assert!(killed.success());

    let output = child.wait_with_output().expect("render exits");
    let text = combined_output(&output);
    assert!(output.status.success(), "interrupted render failed: {text}");
    assert!(text.contains("status=cancelled"), "{text}");

    let names = output_names(&out);
    assert!(names.len() < 23, "render ran to completion: {names:?}");
    for name in &names {
        assert!(name.ends_with(".png"), "leftover temp file {name}");
        image::open(out.join(name)).expect("complete png");
    }
}
