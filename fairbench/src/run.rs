// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{debug, info};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use fair_util::*;
use fairbench_intf::{Args, CacheMode, RunMode, WorkloadSpec, Workloads};

use super::cgroup::ResourceGroupController;
use super::launcher::Launcher;
use super::testfiles::TestFiles;

/// What happened to one (workload or client, cache mode) execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub name: String,
    pub cache_mode: CacheMode,
    pub phases_total: usize,
    pub phases_ok: usize,
    /// Phase copied to the canonical result, multi-phase workloads only.
    pub canonical_phase: Option<u32>,
    pub error: Option<String>,
}

impl ExecRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.phases_ok == self.phases_total
    }
}

pub struct RunCtx {
    pub args: Args,
    pub workloads: Workloads,
    pub launcher: Box<dyn Launcher>,
    pub fio: PathBuf,
    pub iostat: Option<PathBuf>,
    pub self_exe: PathBuf,
    pub out_dir: PathBuf,
    pub testfiles: TestFiles,
    pub rgroups: Option<ResourceGroupController>,
    pub ledger: Vec<ExecRecord>,
    pub drop_caches_knob: PathBuf,
    pub cache_settle: Duration,
    pub mode_settle: Duration,
    pub dual_settle: Duration,
}

impl RunCtx {
    pub const DROP_CACHES_KNOB: &'static str = "/proc/sys/vm/drop_caches";
    pub const IOSTAT_DIR: &'static str = "iostat";

    pub fn new(
        args: Args,
        workloads: Workloads,
        launcher: Box<dyn Launcher>,
        fio: PathBuf,
    ) -> Result<Self> {
        let testfiles = TestFiles::new(&args.testfile_dir, args.verbosity > 0);
        Ok(Self {
            out_dir: PathBuf::from(&args.output),
            args,
            workloads,
            launcher,
            fio,
            iostat: None,
            self_exe: env::current_exe().context("locating the current executable")?,
            testfiles,
            rgroups: None,
            ledger: vec![],
            drop_caches_knob: PathBuf::from(Self::DROP_CACHES_KNOB),
            cache_settle: Duration::from_secs(1),
            mode_settle: Duration::from_secs(1),
            dual_settle: Duration::from_secs(2),
        })
    }

    pub fn iostat_dir(&self) -> PathBuf {
        self.out_dir.join(Self::IOSTAT_DIR)
    }

    fn artifact_stem(name: &str, cache_mode: CacheMode, phase: Option<u32>) -> String {
        match phase {
            Some(nr) => format!("{}_{}_phase{}", name, cache_mode.name(), nr),
            None => format!("{}_{}", name, cache_mode.name()),
        }
    }

    /// Result file of one phase, or of the whole run if `phase` is None.
    /// The latter is also where reconciliation puts the canonical result.
    pub fn artifact_path(&self, name: &str, cache_mode: CacheMode, phase: Option<u32>) -> PathBuf {
        self.out_dir
            .join(Self::artifact_stem(name, cache_mode, phase) + ".json")
    }

    pub fn ts_log_prefix(&self, name: &str, cache_mode: CacheMode, phase: Option<u32>) -> PathBuf {
        self.out_dir.join(Self::artifact_stem(name, cache_mode, phase))
    }

    /// Workloads the selected mode runs.
    pub fn selected_workloads(&self) -> Vec<&WorkloadSpec> {
        match &self.args.mode {
            RunMode::Dual => self
                .args
                .clients
                .iter()
                .filter_map(|c| self.workloads.get(c))
                .collect(),
            RunMode::All => self.workloads.values().collect(),
            RunMode::Workload(name) => self.workloads.get(name).into_iter().collect(),
        }
    }

    pub fn prepare_testfiles(&mut self) -> Result<()> {
        let mut sizes = vec![];
        for wl in self.selected_workloads() {
            sizes.extend(wl.file_sizes());
        }
        self.testfiles
            .prepare(&sizes)
            .context("provisioning test files")?;
        Ok(())
    }

    /// Start from an empty output directory.
    pub fn prepare_output_dir(&self) -> Result<()> {
        if self.out_dir.exists() {
            info!("run: removing previous results in {:?}", &self.out_dir);
            fs::remove_dir_all(&self.out_dir)
                .with_context(|| format!("removing {:?}", &self.out_dir))?;
        }
        let iostat_dir = self.iostat_dir();
        fs::create_dir_all(&iostat_dir).with_context(|| format!("creating {:?}", &iostat_dir))?;
        Ok(())
    }

    /// Flush dirty pages and drop the page cache so that runs start cold.
    pub fn reset_caches(&self) {
        nix::unistd::sync();
        if let Err(e) = write_one_line(&self.drop_caches_knob, "3") {
            debug!(
                "run: failed to write {:?} ({:#}), dropping test file caches instead",
                &self.drop_caches_knob, &e
            );
            self.testfiles.drop_caches();
        }
        sleep_unless_exiting(self.cache_settle);
    }

    pub fn record(&mut self, rec: ExecRecord) {
        self.ledger.push(rec);
    }

    #[cfg(test)]
    pub fn for_test(args: Args, workloads: Workloads, launcher: Box<dyn Launcher>) -> Self {
        let mut rctx = Self::new(args, workloads, launcher, PathBuf::from("fio")).unwrap();
        rctx.drop_caches_knob = rctx.out_dir.join("drop_caches");
        rctx.cache_settle = Duration::from_secs(0);
        rctx.mode_settle = Duration::from_secs(0);
        rctx.dual_settle = Duration::from_secs(0);
        rctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::tests::FakeLauncher;
    use fairbench_intf::parse_workloads;

    const CONFIG: &str = "\
[a]
file_size = 64k
[b]
file_size = 32k
phase_1_runtime = 1
phase_1_block_size = 4k
phase_1_iodepth = 1
phase_1_pattern = read
phase_2_runtime = 1
phase_2_block_size = 4k
phase_2_iodepth = 1
phase_2_pattern = read
phase_2_file_size = 64k
";

    #[test]
    fn test_paths_and_selection() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let mut args = Args::default();
        args.output = dir.path().join("out").to_string_lossy().to_string();
        args.testfile_dir = dir.path().to_string_lossy().to_string();
        args.mode = RunMode::All;
        args.clients = vec!["a".into(), "b".into()];

        let mut rctx = RunCtx::for_test(
            args,
            parse_workloads(CONFIG).unwrap(),
            Box::new(FakeLauncher::new()),
        );
        assert_eq!(
            rctx.artifact_path("b", CacheMode::Direct, Some(2)),
            dir.path().join("out/b_direct_phase2.json")
        );
        assert_eq!(
            rctx.artifact_path("b", CacheMode::Cached, None),
            dir.path().join("out/b_cached.json")
        );
        assert_eq!(rctx.selected_workloads().len(), 2);

        rctx.prepare_output_dir().unwrap();
        fs::write(rctx.out_dir.join("stale.json"), "{}").unwrap();
        rctx.prepare_output_dir().unwrap();
        assert!(!rctx.out_dir.join("stale.json").exists());
        assert!(rctx.iostat_dir().is_dir());

        rctx.prepare_testfiles().unwrap();
        assert!(rctx.testfiles.path("32k").is_some());
        assert!(rctx.testfiles.path("64k").is_some());

        // Without a writable drop_caches knob, falls back to fadvise.
        rctx.reset_caches();
        fs::write(&rctx.drop_caches_knob, "").unwrap();
        rctx.reset_caches();
        assert_eq!(fs::read_to_string(&rctx.drop_caches_knob).unwrap(), "3");

        rctx.args.mode = RunMode::Workload("a".into());
        assert_eq!(rctx.selected_workloads()[0].name, "a");
        rctx.args.mode = RunMode::Workload("zzz".into());
        assert!(rctx.selected_workloads().is_empty());
    }
}
