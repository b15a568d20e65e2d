// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Result};
use log::{error, info, log, warn, Level};

use fair_util::*;
use fairbench_intf::{CacheMode, EffectivePhase, WorkloadSpec};

use super::fio::FioJob;
use super::launcher::{Launch, Output};
use super::monitor::start_iostat;
use super::reconcile::{artifact_ok, reconcile_workload};
use super::run::{ExecRecord, RunCtx};

/// Results of one pass over a workload's phases.
#[derive(Debug, Default)]
pub struct PhaseRun {
    pub total: usize,
    pub ok: Vec<Option<u32>>,
    pub failures: Vec<String>,
}

fn describe(ph: &EffectivePhase) -> String {
    let mut buf = format!(
        "{} bs={} iodepth={} numjobs={} size={} runtime={}s",
        ph.pattern, &ph.block_size, ph.iodepth, ph.numjobs, &ph.file_size, ph.runtime
    );
    if let Some(rate) = ph.rate_iops {
        buf += &format!(" rate_iops={}", rate);
    }
    buf
}

/// The exact fio command line is shown from `-v` up.
fn launch_log_level(verbosity: u32) -> Level {
    match verbosity {
        0 => Level::Debug,
        _ => Level::Info,
    }
}

fn phase_label(nr: Option<u32>) -> String {
    match nr {
        Some(nr) => format!("phase {}", nr),
        None => "single phase".into(),
    }
}

/// Run `wl`'s phases in order for one cache mode. Each fio invocation must
/// exit before the next one starts and the cache is left alone in between.
/// Clients additionally record per-second time-series logs.
pub fn run_phases(rctx: &RunCtx, wl: &WorkloadSpec, cache_mode: CacheMode, as_client: bool) -> PhaseRun {
    let phases = wl.effective_phases();
    let mut run = PhaseRun {
        total: phases.len(),
        ..Default::default()
    };

    for ph in phases.iter() {
        let label = phase_label(ph.number);
        if prog_exiting() {
            run.failures.push(format!("interrupted before {}", &label));
            break;
        }

        let filename = match rctx.testfiles.path(&ph.file_size) {
            Some(v) => v,
            None => {
                error!(
                    "driver: [{}/{}] {}: no test file for size {:?}",
                    &wl.name, cache_mode, &label, &ph.file_size
                );
                run.failures.push(format!("{}: missing test file", &label));
                continue;
            }
        };

        let output = rctx.artifact_path(&wl.name, cache_mode, ph.number);
        let job = FioJob {
            name: &wl.name,
            filename,
            phase: ph,
            cache_mode,
            output: output.clone(),
            ts_log_prefix: match as_client {
                true => Some(rctx.ts_log_prefix(&wl.name, cache_mode, ph.number)),
                false => None,
            },
        };
        let launch = Launch::new(&rctx.fio, job.args()).stdout(match rctx.args.verbosity {
            0 => Output::Null,
            _ => Output::Inherit,
        });

        info!("driver: [{}/{}] {}: {}", &wl.name, cache_mode, &label, describe(ph));
        log!(launch_log_level(rctx.args.verbosity), "driver: {}", &launch);

        match rctx.launcher.run(&launch) {
            Ok(status) if !status.success() => warn!(
                "driver: [{}/{}] {}: fio exited with {}",
                &wl.name, cache_mode, &label, &status
            ),
            Ok(_) => {}
            Err(e) => error!(
                "driver: [{}/{}] {}: {:#}",
                &wl.name, cache_mode, &label, &e
            ),
        }

        if artifact_ok(&output) {
            run.ok.push(ph.number);
        } else {
            error!(
                "driver: [{}/{}] {}: no result in {:?}",
                &wl.name, cache_mode, &label, &output
            );
            run.failures.push(format!("{}: no result", &label));
        }
    }
    run
}

/// Run workload `name` once per active cache mode, each under its own
/// iostat log and from a cold page cache.
pub fn run_workload(rctx: &mut RunCtx, name: &str) -> Result<()> {
    let wl = rctx
        .workloads
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("unknown workload {:?}", name))?;

    let phase_nrs: Vec<u32> = wl.phases.iter().map(|p| p.number).collect();
    if wl.is_multi_phase() {
        info!(
            "driver: [{}] {} phases {:?}",
            name,
            phase_nrs.len(),
            &phase_nrs
        );
    }

    for cache_mode in rctx.args.cache_modes.modes() {
        if prog_exiting() {
            warn!("driver: [{}] interrupted, skipping {}", name, cache_mode);
            break;
        }

        let monitor = start_iostat(rctx, &format!("{}_{}.iostat", name, cache_mode));
        rctx.reset_caches();
        let run = run_phases(rctx, &wl, cache_mode, false);
        drop(monitor);

        let canonical_phase = match wl.is_multi_phase() {
            true => reconcile_workload(rctx, name, cache_mode, &phase_nrs),
            false => None,
        };

        let rec = ExecRecord {
            name: name.to_string(),
            cache_mode,
            phases_total: run.total,
            phases_ok: run.ok.len(),
            canonical_phase,
            error: match run.failures.is_empty() {
                true => None,
                false => Some(run.failures.join(", ")),
            },
        };
        if rec.succeeded() {
            info!("driver: [{}/{}] completed", name, cache_mode);
        } else {
            error!(
                "driver: [{}/{}] failed, {}/{} phases produced results",
                name, cache_mode, rec.phases_ok, rec.phases_total
            );
        }
        rctx.record(rec);

        sleep_unless_exiting(rctx.mode_settle);
    }
    Ok(())
}
