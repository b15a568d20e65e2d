// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use log::{error, info, warn};
use std::process::{self, Child};

use fair_util::*;
use fairbench_intf::{CacheMode, Workloads};

use super::cgroup::AttachOutcome;
use super::driver::run_phases;
use super::launcher::Launch;
use super::monitor::start_iostat;
use super::reconcile::{artifact_ok, reconcile_workload};
use super::run::{ExecRecord, RunCtx};

/// Both dual-mode clients must be defined workloads.
pub fn check_clients(workloads: &Workloads, clients: &[String]) -> Result<()> {
    let missing: Vec<&str> = clients
        .iter()
        .filter(|c| !workloads.contains_key(*c))
        .map(|c| c.as_str())
        .collect();
    if !missing.is_empty() {
        bail!(
            "dual mode needs workloads {:?} but {:?} missing from the configuration",
            clients,
            missing
        );
    }
    Ok(())
}

struct ClientProc<'a> {
    name: &'a str,
    child: Option<Child>,
    error: Option<String>,
}

fn spawn_client<'a>(rctx: &RunCtx, name: &'a str, cache_mode: CacheMode) -> ClientProc<'a> {
    let launch = Launch::new(
        &rctx.self_exe,
        rctx.args.client_proc_args(name, cache_mode, &rctx.fio),
    );
    let child = match rctx.launcher.spawn(&launch) {
        Ok(v) => v,
        Err(e) => {
            error!("dual: [{}/{}] failed to start ({:#})", name, cache_mode, &e);
            return ClientProc {
                name,
                child: None,
                error: Some(format!("failed to start ({:#})", &e)),
            };
        }
    };
    info!("dual: [{}/{}] started as {}", name, cache_mode, child.id());

    // The child attaches itself too, this covers the window before it does.
    if let Some(rgroups) = rctx.rgroups.as_ref() {
        if rgroups.attach(name, child.id()) == AttachOutcome::NoGroup {
            warn!("dual: [{}] has no resource group, running unisolated", name);
        }
    }

    ClientProc {
        name,
        child: Some(child),
        error: None,
    }
}

fn wait_client(cproc: &mut ClientProc, cache_mode: CacheMode) {
    let child = match cproc.child.as_mut() {
        Some(v) => v,
        None => return,
    };
    match child.wait() {
        Ok(status) if status.success() => {
            info!("dual: [{}/{}] finished", cproc.name, cache_mode)
        }
        Ok(status) => {
            error!("dual: [{}/{}] exited with {}", cproc.name, cache_mode, &status);
            cproc.error = Some(format!("exited with {}", &status));
        }
        Err(e) => {
            error!("dual: [{}/{}] failed to wait ({})", cproc.name, cache_mode, &e);
            cproc.error = Some(format!("wait failed ({})", &e));
        }
    }
}

/// Run the two clients concurrently, once per cache mode. Each client is a
/// separate process running its own phase sequence in its own resource
/// group; they're never synchronized with each other.
pub fn run_dual(rctx: &mut RunCtx) -> Result<()> {
    check_clients(&rctx.workloads, &rctx.args.clients)?;
    let clients = rctx.args.clients.clone();

    for cache_mode in rctx.args.cache_modes.modes() {
        if prog_exiting() {
            warn!("dual: interrupted, skipping {}", cache_mode);
            break;
        }
        info!("dual: running {} concurrently ({})", clients.join(" and "), cache_mode);

        let monitor = start_iostat(rctx, &format!("concurrent_{}.iostat", cache_mode));
        rctx.reset_caches();

        let mut procs = vec![];
        for name in clients.iter() {
            procs.push(spawn_client(rctx, name, cache_mode));
        }
        for cproc in procs.iter_mut() {
            wait_client(cproc, cache_mode);
        }

        drop(monitor);
        sleep_unless_exiting(rctx.dual_settle);

        let mut recs = vec![];
        for cproc in procs.into_iter() {
            let wl = &rctx.workloads[cproc.name];
            let phases = wl.effective_phases();
            let phases_ok = phases
                .iter()
                .filter(|ph| artifact_ok(&rctx.artifact_path(cproc.name, cache_mode, ph.number)))
                .count();
            let phase_nrs: Vec<u32> = wl.phases.iter().map(|p| p.number).collect();
            let canonical_phase = match wl.is_multi_phase() {
                true => reconcile_workload(rctx, cproc.name, cache_mode, &phase_nrs),
                false => None,
            };
            recs.push(ExecRecord {
                name: cproc.name.to_string(),
                cache_mode,
                phases_total: phases.len(),
                phases_ok,
                canonical_phase,
                error: cproc.error,
            });
        }
        for rec in recs.into_iter() {
            rctx.record(rec);
        }
    }
    Ok(())
}

/// Body of a spawned client process. Returns whether every phase produced a
/// result.
pub fn run_client_proc(rctx: &RunCtx, client: &str, cache_mode: CacheMode) -> Result<bool> {
    let wl = match rctx.workloads.get(client) {
        Some(v) => v,
        None => bail!("unknown client workload {:?}", client),
    };

    if let Some(rgroups) = rctx.rgroups.as_ref() {
        rgroups.attach(client, process::id());
    }

    let run = run_phases(rctx, wl, cache_mode, true);
    for failure in run.failures.iter() {
        warn!("dual: [{}/{}] {}", client, cache_mode, failure);
    }
    Ok(run.failures.is_empty())
}
