// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use log::{info, warn};
use simplelog as sl;
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, UNIX_EPOCH};

pub mod json_file;

pub use json_file::{ArgsFile, JsonArgs, JsonArgsHelper, JsonLoad, JsonSave};

fn underline_with(content: &str, ch: char) -> String {
    let indent = content.len() - content.trim_start().len();
    let width = content.trim_start().chars().count();
    format!(
        "{}\n{}{}\n",
        content,
        " ".repeat(indent),
        ch.to_string().repeat(width)
    )
}

pub fn underline(content: &str) -> String {
    underline_with(content, '-')
}

pub fn double_underline(content: &str) -> String {
    underline_with(content, '=')
}

const SIZE_UNITS: &[(char, u32)] = &[
    ('B', 0),
    ('K', 10),
    ('M', 20),
    ('G', 30),
    ('T', 40),
    ('P', 50),
    ('E', 60),
];

/// Human-readable power-of-two size, e.g. "1.5G". Values below 10000 are
/// printed as plain byte counts.
pub fn format_size<T: num::ToPrimitive>(size: T) -> String {
    let bytes = size.to_u64().unwrap_or(0);
    if bytes < 10000 {
        return bytes.to_string();
    }
    let mut val = bytes as f64;
    for (suffix, _) in SIZE_UNITS.iter().skip(1) {
        val /= 1024.0;
        if val < 1024.0 {
            return match val < 99.95 {
                true => format!("{:.1}{}", val, suffix),
                false => format!("{:.0}{}", val, suffix),
            };
        }
    }
    "INF".into()
}

/// Parse a human-readable size expression into bytes. Suffixes are
/// power-of-two (`K` = 1024) and case-insensitive, `_` is ignored and
/// terms add up, e.g. "2G_16.5M".
pub fn parse_size(input: &str) -> Result<u64> {
    let term = |num: &str, shift: u32| -> Result<u64> {
        if num.is_empty() {
            bail!("missing number before unit in {:?}", input);
        }
        if num.contains('.') {
            let v: f64 = num.parse().with_context(|| format!("invalid size {:?}", input))?;
            return Ok((v * (1u64 << shift) as f64).round() as u64);
        }
        let v: u64 = num.parse().with_context(|| format!("invalid size {:?}", input))?;
        v.checked_mul(1 << shift)
            .ok_or_else(|| anyhow!("{:?} overflows", input))
    };

    if input.trim().is_empty() {
        bail!("empty size");
    }

    let mut sum = 0u64;
    let mut add = |v: u64| -> Result<()> {
        sum = sum
            .checked_add(v)
            .ok_or_else(|| anyhow!("{:?} overflows", input))?;
        Ok(())
    };
    let mut num = String::new();
    for ch in input.chars().filter(|c| *c != '_') {
        let upper = ch.to_ascii_uppercase();
        match SIZE_UNITS.iter().find(|(u, _)| *u == upper) {
            Some((_, shift)) => {
                add(term(num.trim(), *shift)?)?;
                num.clear();
            }
            None => num.push(ch),
        }
    }
    if !num.trim().is_empty() {
        add(term(num.trim(), 0)?)?;
    }
    Ok(sum)
}

fn executable(path: &Path) -> Option<PathBuf> {
    let path = path.canonicalize().ok()?;
    let md = path.metadata().ok()?;
    match md.is_file() && md.permissions().mode() & 0o111 != 0 {
        true => Some(path),
        false => None,
    }
}

pub fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("locating the current executable")?;
    Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
}

/// Locate executable `name`. A name with a directory component is checked
/// as is, otherwise `extra_dir` and then `PATH` are searched.
pub fn find_bin<N: AsRef<OsStr>, P: AsRef<Path>>(name: N, extra_dir: Option<P>) -> Option<PathBuf> {
    let name = Path::new(name.as_ref());
    if name.components().count() > 1 {
        return executable(name);
    }

    let mut dirs: Vec<PathBuf> = extra_dir
        .map(|d| d.as_ref().to_path_buf())
        .into_iter()
        .collect();
    if let Some(path) = env::var_os("PATH") {
        dirs.extend(env::split_paths(&path));
    }
    dirs.iter().find_map(|dir| executable(&dir.join(name)))
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    match text.lines().next() {
        Some(line) => Ok(line.to_string()),
        None => bail!("{:?} is empty", path),
    }
}

/// Write `line` to an existing file, sysfs style.
pub fn write_one_line<P: AsRef<Path>>(path: P, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new().write(true).open(path)?;
    f.write_all(line.as_bytes())?;
    Ok(())
}

/// Read a file with one integer per line, e.g. `cgroup.procs`.
pub fn read_pid_list<P: AsRef<Path>>(path: P) -> Result<Vec<i32>> {
    let path = path.as_ref();
    fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.parse::<i32>()
                .with_context(|| format!("invalid pid {:?} in {:?}", l, path))
        })
        .collect()
}

pub fn unix_now() -> u64 {
    UNIX_EPOCH.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}

pub fn format_unix_time(time: u64) -> String {
    DateTime::<Local>::from(UNIX_EPOCH + Duration::from_secs(time))
        .format("%x %T")
        .to_string()
}

/// Local time suitable for file names and records, e.g. "20240131_235959".
pub fn timestamp_tag() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// `RUST_LOG` hands logging to env_logger. Otherwise simplelog logs to the
/// terminal, or plainly to stderr when nobody's watching.
pub fn init_logging(verbosity: u32) {
    if env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }

    let level = match verbosity {
        0 | 1 => sl::LevelFilter::Info,
        2 => sl::LevelFilter::Debug,
        _ => sl::LevelFilter::Trace,
    };
    let mut cfg = sl::ConfigBuilder::new();
    cfg.set_time_level(sl::LevelFilter::Off)
        .set_location_level(sl::LevelFilter::Off)
        .set_target_level(sl::LevelFilter::Off)
        .set_thread_level(sl::LevelFilter::Off);

    if console::user_attended_stderr()
        && sl::TermLogger::init(
            level,
            cfg.build(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        )
        .is_ok()
    {
        return;
    }
    let _ = sl::SimpleLogger::init(level, cfg.build());
}

/// Fill `area` with pseudo-random words. The content only needs to defeat
/// zero-page and compression shortcuts, so a fast rng is enough.
pub fn fill_area_with_random<R: rand::Rng + ?Sized>(area: &mut [u8], rng: &mut R) {
    let mut chunks = area.chunks_exact_mut(8);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&rng.gen::<u64>().to_ne_bytes());
    }
    for byte in chunks.into_remainder() {
        *byte = rng.gen();
    }
}

lazy_static::lazy_static! {
    static ref EXITING: Mutex<bool> = Mutex::new(false);
    static ref EXITING_WAITQ: Condvar = Condvar::new();
}

pub fn setup_prog_state() {
    if let Err(e) = ctrlc::set_handler(|| {
        info!("SIGINT/TERM received, exiting...");
        set_prog_exiting();
    }) {
        warn!("Failed to install SIGINT/TERM handler ({})", &e);
    }
}

pub fn set_prog_exiting() {
    *EXITING.lock().unwrap() = true;
    EXITING_WAITQ.notify_all();
}

pub fn prog_exiting() -> bool {
    *EXITING.lock().unwrap()
}

/// Sleep for `dur` unless the program starts exiting. Returns false if
/// woken up by exiting.
pub fn sleep_unless_exiting(dur: Duration) -> bool {
    let exiting = EXITING.lock().unwrap();
    let (exiting, _) = EXITING_WAITQ
        .wait_timeout_while(exiting, dur, |exiting| !*exiting)
        .unwrap();
    !*exiting
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        for (input, bytes) in &[
            ("512", 512),
            ("4k", 4096),
            ("64K", 64 << 10),
            ("1.5M", 3 << 19),
            ("1G", 1 << 30),
            ("2G_16.5M", (2 << 30) + (33 << 19)),
            ("1g 512m", (1 << 30) + (512 << 20)),
        ] {
            assert_eq!(parse_size(input).unwrap(), *bytes, "{:?}", input);
        }
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        for input in &["", "  ", "G", "1X", "abc", "1..5G", "99999999999E", "8E8E"] {
            assert!(parse_size(input).is_err(), "{:?} parsed", input);
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0u64), "0");
        assert_eq!(format_size(4096u64), "4096");
        assert_eq!(format_size(1u64 << 30), "1.0G");
        assert_eq!(format_size(3u64 << 19), "1.5M");
        assert_eq!(format_size(500u64 << 20), "500M");
    }

    #[test]
    fn test_sysfs_files() {
        let dir = tempfile::tempdir().unwrap();
        let procs = dir.path().join("cgroup.procs");
        fs::write(&procs, "12\n345\n\n6789\n").unwrap();
        assert_eq!(read_pid_list(&procs).unwrap(), vec![12, 345, 6789]);

        let knob = dir.path().join("io.weight");
        assert!(write_one_line(&knob, "100").is_err());
        fs::write(&knob, "").unwrap();
        write_one_line(&knob, "default 100").unwrap();
        assert_eq!(read_one_line(&knob).unwrap(), "default 100");
    }

    #[test]
    fn test_find_bin() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("fairbench-test-bin");
        fs::write(&bin, "#!/bin/sh\n").unwrap();
        assert_eq!(find_bin("fairbench-test-bin", Some(dir.path())), None);

        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
        let found = bin.canonicalize().unwrap();
        assert_eq!(
            find_bin("fairbench-test-bin", Some(dir.path())),
            Some(found.clone())
        );
        assert_eq!(find_bin(&bin, None::<&Path>), Some(found));
    }

    #[test]
    fn test_fill_area_with_random() {
        let mut rng = <rand::rngs::SmallRng as rand::SeedableRng>::seed_from_u64(7);
        let mut buf = vec![0u8; 4099];
        fill_area_with_random(&mut buf, &mut rng);
        assert!(buf.iter().filter(|b| **b != 0).count() > 3000);
    }

    #[test]
    fn test_underline() {
        assert_eq!(underline("  abc"), "  abc\n  ---\n");
        assert_eq!(double_underline("ab"), "ab\n==\n");
    }
}
