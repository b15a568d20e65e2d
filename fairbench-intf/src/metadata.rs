// Copyright (c) Facebook, Inc. and its affiliates.
use serde::{Deserialize, Serialize};

use super::{Args, CacheMode};
use fair_util::*;

/// Description of a run, saved next to its results so that the analysis
/// tooling knows what produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    pub timestamp: String,
    pub start_at: u64,
    pub config: String,
    pub cgroup_config: String,
    pub run_type: String,
    pub mode: String,
    pub cache_modes: Vec<CacheMode>,
    pub isolation: bool,
    pub version: String,
}

impl RunMetadata {
    pub const FILENAME: &'static str = "metadata.json";

    pub fn new(args: &Args, isolation: bool) -> Self {
        Self {
            timestamp: timestamp_tag(),
            start_at: unix_now(),
            config: args.config.clone(),
            cgroup_config: args.cgroup_config.clone(),
            run_type: args.mode.run_type().to_string(),
            mode: args.mode.to_string(),
            cache_modes: args.cache_modes.modes(),
            isolation,
            version: super::VERSION.to_string(),
        }
    }
}

impl JsonLoad for RunMetadata {}
impl JsonSave for RunMetadata {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheModeFilter, RunMode};

    #[test]
    fn test_metadata() {
        let mut args = Args::default();
        args.mode = RunMode::All;
        args.cache_modes = CacheModeFilter::Direct;

        let md = RunMetadata::new(&args, false);
        assert_eq!(md.run_type, "all_workloads");
        assert_eq!(md.cache_modes, vec![CacheMode::Direct]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RunMetadata::FILENAME);
        md.save(&path).unwrap();
        assert_eq!(RunMetadata::load(&path).unwrap(), md);
    }
}
