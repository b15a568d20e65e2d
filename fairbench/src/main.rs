// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::exit;

use fair_util::*;
use fairbench_intf::{load_resource_groups, load_workloads, Args, RunMetadata, RunMode, Workloads};

mod cgroup;
mod coordinator;
mod driver;
mod fio;
mod launcher;
mod monitor;
mod reconcile;
mod run;
mod testfiles;

use cgroup::{CgroupV2, ResourceGroupController};
use launcher::SysLauncher;
use run::RunCtx;

fn locate_fio(args: &Args) -> Result<PathBuf> {
    let name = args.fio.as_deref().unwrap_or("fio");
    find_bin(name, exe_dir().ok())
        .ok_or_else(|| anyhow!("can't find {:?}, install fio or point --fio at it", name))
}

fn init_isolation(args: &Args) -> Result<Option<ResourceGroupController>> {
    if args.no_cgroups {
        info!("cgroup: resource isolation disabled by --no-cgroups");
        return Ok(None);
    }

    let groups = match load_resource_groups(&args.cgroup_config)? {
        Some(v) if !v.is_empty() => v,
        Some(_) => {
            info!(
                "cgroup: no groups in {:?}, resource isolation disabled",
                &args.cgroup_config
            );
            return Ok(None);
        }
        None => {
            info!(
                "cgroup: {:?} not found, resource isolation disabled",
                &args.cgroup_config
            );
            return Ok(None);
        }
    };

    let backend = CgroupV2::new(&args.cgroup_root);
    if !backend.is_available() {
        warn!(
            "cgroup: no cgroup v2 hierarchy at {:?}, resource isolation disabled",
            &args.cgroup_root
        );
        return Ok(None);
    }
    Ok(Some(ResourceGroupController::new(Box::new(backend), groups)))
}

fn check_mode(args: &Args, workloads: &Workloads) -> Result<()> {
    match &args.mode {
        RunMode::Dual => coordinator::check_clients(workloads, &args.clients),
        RunMode::All => Ok(()),
        RunMode::Workload(name) => {
            if !workloads.contains_key(name) {
                bail!(
                    "unknown workload {:?}, available: {}",
                    name,
                    workloads.keys().cloned().collect::<Vec<_>>().join(", ")
                );
            }
            Ok(())
        }
    }
}

fn run(args: Args) -> Result<()> {
    let workloads = load_workloads(&args.config)
        .with_context(|| format!("loading workloads from {:?}", &args.config))?;
    info!(
        "run: {} workloads loaded from {:?}",
        workloads.len(),
        &args.config
    );
    check_mode(&args, &workloads)?;

    let fio = locate_fio(&args)?;
    let iostat = find_bin("iostat", exe_dir().ok());
    if iostat.is_none() {
        warn!("monitor: iostat not found, continuing without iostat logs");
    }
    let rgroups = init_isolation(&args)
        .with_context(|| format!("loading resource groups from {:?}", &args.cgroup_config))?;
    let isolation = rgroups.is_some();

    let mut rctx = RunCtx::new(args, workloads, Box::new(SysLauncher), fio)?;
    rctx.iostat = iostat;
    rctx.rgroups = rgroups;

    rctx.prepare_output_dir()?;
    RunMetadata::new(&rctx.args, isolation)
        .save(rctx.out_dir.join(RunMetadata::FILENAME))
        .context("saving run metadata")?;
    rctx.prepare_testfiles()?;

    if let Some(rgroups) = rctx.rgroups.as_mut() {
        rgroups.setup_all();
    }

    match rctx.args.mode.clone() {
        RunMode::Dual => coordinator::run_dual(&mut rctx)?,
        RunMode::All => {
            let names: Vec<String> = rctx.workloads.keys().cloned().collect();
            for name in names.iter() {
                if prog_exiting() {
                    break;
                }
                driver::run_workload(&mut rctx, name)?;
            }
        }
        RunMode::Workload(name) => driver::run_workload(&mut rctx, &name)?,
    }

    if prog_exiting() {
        warn!("run: interrupted, results are incomplete");
    }

    if let Some(rgroups) = rctx.rgroups.as_mut() {
        if rctx.args.keep_cgroups {
            info!("cgroup: leaving resource groups in place");
        } else {
            rgroups.teardown_all();
        }
    }

    let summary = reconcile::write_summary(&rctx, isolation)?;
    let nr_failed = rctx.ledger.iter().filter(|r| !r.succeeded()).count();
    if nr_failed > 0 {
        warn!(
            "run: {}/{} executions failed, see {:?}",
            nr_failed,
            rctx.ledger.len(),
            &summary
        );
    }
    info!(
        "run: results in {:?}, analyze with ./quick_fairness_analysis.py {}",
        &rctx.out_dir,
        rctx.out_dir.display()
    );
    Ok(())
}

fn run_client(args: Args, client: &str) -> Result<bool> {
    let cache_mode = args
        .client_cache_mode
        .ok_or_else(|| anyhow!("cache mode not specified"))?;
    let workloads = load_workloads(&args.config)?;
    let sizes = match workloads.get(client) {
        Some(wl) => wl.file_sizes(),
        None => bail!("unknown client workload {:?}", client),
    };
    let fio = locate_fio(&args)?;
    let rgroups = match init_isolation(&args) {
        Ok(v) => v,
        Err(e) => {
            warn!("cgroup: [{}] running unisolated ({:#})", client, &e);
            None
        }
    };

    let mut rctx = RunCtx::new(args, workloads, Box::new(SysLauncher), fio)?;
    rctx.rgroups = rgroups;
    // Already provisioned by the coordinator, this only looks them up.
    rctx.testfiles.prepare(&sizes)?;

    coordinator::run_client_proc(&rctx, client, cache_mode)
}

fn main() {
    setup_prog_state();

    let (args_file, updated) = Args::init_args_and_logging_nosave().unwrap_or_else(|e| {
        error!("Failed to process args file ({:#})", &e);
        exit(1);
    });

    if let Some(client) = args_file.data.client_proc.clone() {
        match run_client(args_file.data, &client) {
            Ok(true) => exit(0),
            Ok(false) => exit(1),
            Err(e) => {
                error!("client: [{}] {:#}", &client, &e);
                exit(1);
            }
        }
    }

    if updated {
        if let Err(e) = Args::save_args(&args_file) {
            error!("Failed to update args file ({:#})", &e);
            exit(1);
        }
    }

    if let Err(e) = run(args_file.data) {
        error!("{:#}", &e);
        exit(1);
    }
}
