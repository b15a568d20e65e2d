// Copyright (c) Facebook, Inc. and its affiliates.
use fairbench_intf::{CacheMode, EffectivePhase};
use std::path::{Path, PathBuf};

const STATUS_INTERVAL: u32 = 5;
const LOG_AVG_MSEC: u32 = 1000;

/// One fio invocation.
#[derive(Debug, Clone)]
pub struct FioJob<'a> {
    pub name: &'a str,
    pub filename: &'a Path,
    pub phase: &'a EffectivePhase,
    pub cache_mode: CacheMode,
    pub output: PathBuf,
    /// Prefix for the per-second latency, bandwidth and IOPS logs.
    pub ts_log_prefix: Option<PathBuf>,
}

impl<'a> FioJob<'a> {
    pub fn args(&self) -> Vec<String> {
        let ph = self.phase;
        let mut args = vec![
            format!("--name={}", self.name),
            format!("--filename={}", self.filename.display()),
            format!("--size={}", &ph.file_size),
            format!("--runtime={}", ph.runtime),
            "--time_based=1".to_string(),
            format!("--rw={}", ph.pattern.fio_name()),
            format!("--bs={}", &ph.block_size),
            format!("--numjobs={}", ph.numjobs),
            format!("--iodepth={}", ph.iodepth),
        ];
        if let Some(engine) = ph.ioengine.as_ref() {
            args.push(format!("--ioengine={}", engine));
        }
        if let Some(rate) = ph.rate_iops {
            args.push(format!("--rate_iops={}", rate));
        }
        args.push("--group_reporting=1".into());
        args.push("--output-format=json".into());
        args.push(format!("--output={}", self.output.display()));

        match self.ts_log_prefix.as_ref() {
            Some(prefix) => {
                let prefix = prefix.display();
                args.push(format!("--log_avg_msec={}", LOG_AVG_MSEC));
                args.push(format!("--write_lat_log={}", &prefix));
                args.push(format!("--write_bw_log={}", &prefix));
                args.push(format!("--write_iops_log={}", &prefix));
            }
            None => args.push(format!("--status-interval={}", STATUS_INTERVAL)),
        }

        if self.cache_mode.is_direct() {
            args.push("--direct=1".into());
        }
        args
    }
}
