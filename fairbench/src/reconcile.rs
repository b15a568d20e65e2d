// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{info, warn};
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::{Path, PathBuf};

use fair_util::*;
use fairbench_intf::{CacheMode, RunMetadata};

use super::run::RunCtx;

/// Whether fio left a usable result at `path`.
pub fn artifact_ok(path: &Path) -> bool {
    match path.metadata() {
        Ok(md) => md.is_file() && md.len() > 0,
        Err(_) => false,
    }
}

/// Pick the highest-numbered phase with a usable result and copy it to
/// `canonical`. This reports the last completed phase's statistics and is
/// not a merge across phases.
pub fn reconcile<F>(phases: &[u32], phase_path: F, canonical: &Path) -> Result<Option<u32>>
where
    F: Fn(u32) -> PathBuf,
{
    let mut sorted = phases.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    for nr in sorted.into_iter() {
        let path = phase_path(nr);
        if artifact_ok(&path) {
            fs::copy(&path, canonical)
                .with_context(|| format!("copying {:?} to {:?}", &path, canonical))?;
            return Ok(Some(nr));
        }
    }
    Ok(None)
}

/// Reconcile one (workload, cache mode) pair. Gaps and copy failures are
/// warnings.
pub fn reconcile_workload(rctx: &RunCtx, name: &str, cache_mode: CacheMode, phases: &[u32]) -> Option<u32> {
    let canonical = rctx.artifact_path(name, cache_mode, None);
    match reconcile(
        phases,
        |nr| rctx.artifact_path(name, cache_mode, Some(nr)),
        &canonical,
    ) {
        Ok(Some(nr)) => {
            info!(
                "reconcile: [{}/{}] using phase {} as {:?}",
                name, cache_mode, nr, &canonical
            );
            Some(nr)
        }
        Ok(None) => {
            warn!(
                "reconcile: [{}/{}] no phase produced a result, no combined result",
                name, cache_mode
            );
            None
        }
        Err(e) => {
            warn!("reconcile: [{}/{}] {:#}", name, cache_mode, &e);
            None
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArtifactCounts {
    pub results: usize,
    pub monitor_logs: usize,
    pub ts_logs: usize,
}

fn count_files(dir: &Path, pred: impl Fn(&str) -> bool) -> usize {
    match dir.read_dir() {
        Ok(rd) => rd
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| pred(&e.file_name().to_string_lossy()))
            .count(),
        Err(_) => 0,
    }
}

pub fn count_artifacts(rctx: &RunCtx) -> ArtifactCounts {
    ArtifactCounts {
        results: count_files(&rctx.out_dir, |name| {
            name.ends_with(".json") && name != RunMetadata::FILENAME
        }),
        monitor_logs: count_files(&rctx.iostat_dir(), |name| name.ends_with(".iostat")),
        ts_logs: count_files(&rctx.out_dir, |name| name.ends_with(".log")),
    }
}

pub fn format_summary(rctx: &RunCtx, isolation: bool) -> String {
    let counts = count_artifacts(rctx);
    let mut buf = String::new();

    write!(buf, "{}", double_underline("Fairness benchmark summary")).unwrap();
    writeln!(buf, "Timestamp: {}", format_unix_time(unix_now())).unwrap();
    writeln!(buf, "Run type: {} ({})", rctx.args.mode.run_type(), &rctx.args.mode).unwrap();
    writeln!(buf, "Cache modes: {}", &rctx.args.cache_modes).unwrap();
    writeln!(buf, "Configuration: {}", &rctx.args.config).unwrap();
    writeln!(
        buf,
        "Resource groups: {} ({})",
        &rctx.args.cgroup_config,
        if isolation { "enabled" } else { "disabled" }
    )
    .unwrap();
    writeln!(buf, "Output: {}\n", rctx.out_dir.display()).unwrap();

    write!(buf, "{}", underline("Artifacts")).unwrap();
    writeln!(buf, "JSON results: {}", counts.results).unwrap();
    writeln!(buf, "iostat logs: {}", counts.monitor_logs).unwrap();
    writeln!(buf, "Time-series logs: {}\n", counts.ts_logs).unwrap();

    write!(buf, "{}", underline("Executions")).unwrap();
    let width = rctx.ledger.iter().map(|r| r.name.len()).max().unwrap_or(0);
    for rec in rctx.ledger.iter() {
        write!(
            buf,
            "{:width$} {:6} {} {}/{} phases",
            &rec.name,
            rec.cache_mode.name(),
            if rec.succeeded() { "ok    " } else { "FAILED" },
            rec.phases_ok,
            rec.phases_total,
            width = width
        )
        .unwrap();
        if let Some(nr) = rec.canonical_phase {
            write!(buf, ", combined from phase {}", nr).unwrap();
        }
        if let Some(err) = rec.error.as_ref() {
            write!(buf, " ({})", err).unwrap();
        }
        writeln!(buf).unwrap();
    }
    if rctx.ledger.is_empty() {
        writeln!(buf, "None").unwrap();
    }

    writeln!(
        buf,
        "\nAnalyze with: ./quick_fairness_analysis.py {}",
        rctx.out_dir.display()
    )
    .unwrap();
    buf
}

pub fn write_summary(rctx: &RunCtx, isolation: bool) -> Result<PathBuf> {
    let path = rctx.out_dir.join("summary.txt");
    fs::write(&path, format_summary(rctx, isolation))
        .with_context(|| format!("writing {:?}", &path))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::tests::FakeLauncher;
    use crate::run::ExecRecord;
    use fairbench_intf::{parse_workloads, Args};

    #[test]
    fn test_reconcile_picks_last_nonempty() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let phase_path = |nr: u32| dir.path().join(format!("w_cached_phase{}.json", nr));
        fs::write(phase_path(1), "").unwrap();
        fs::write(phase_path(2), "{\"phase\": 2}").unwrap();
        let canonical = dir.path().join("w_cached.json");

        let picked = reconcile(&[1, 2, 3], phase_path, &canonical).unwrap();
        assert_eq!(picked, Some(2));
        assert_eq!(fs::read_to_string(&canonical).unwrap(), "{\"phase\": 2}");
    }

    #[test]
    fn test_reconcile_nothing_usable() {
        let dir = tempfile::tempdir().unwrap();
        let phase_path = |nr: u32| dir.path().join(format!("p{}.json", nr));
        fs::write(phase_path(1), "").unwrap();
        let canonical = dir.path().join("c.json");

        assert_eq!(reconcile(&[1, 2], phase_path, &canonical).unwrap(), None);
        assert!(!canonical.exists());
    }

    #[test]
    fn test_summary() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::default();
        args.output = dir.path().to_string_lossy().to_string();
        let mut rctx = RunCtx::for_test(
            args,
            parse_workloads("[w]\n").unwrap(),
            Box::new(FakeLauncher::new()),
        );
        rctx.prepare_output_dir().unwrap();

        for name in &["w_cached.json", "w_cached_phase1.json", "metadata.json", "w_cached_phase1_lat.1.log"] {
            fs::write(rctx.out_dir.join(name), "x").unwrap();
        }
        fs::write(rctx.iostat_dir().join("w_cached.iostat"), "x").unwrap();
        assert_eq!(
            count_artifacts(&rctx),
            ArtifactCounts {
                results: 2,
                monitor_logs: 1,
                ts_logs: 1
            }
        );

        rctx.record(ExecRecord {
            name: "w".into(),
            cache_mode: CacheMode::Cached,
            phases_total: 2,
            phases_ok: 1,
            canonical_phase: Some(1),
            error: None,
        });
        let path = write_summary(&rctx, false).unwrap();
        let summary = fs::read_to_string(path).unwrap();
        assert!(summary.contains("JSON results: 2"));
        assert!(summary.contains("FAILED 1/2 phases, combined from phase 1"));
        assert!(summary.contains("(disabled)"));
        assert!(summary.contains("quick_fairness_analysis.py"));
    }
}
