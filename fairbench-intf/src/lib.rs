// Copyright (c) Facebook, Inc. and its affiliates.
use std::path::PathBuf;
use thiserror::Error;

pub mod args;
pub mod ini;
pub mod metadata;
pub mod rgroup;
pub mod workload;

pub use args::{Args, CacheMode, CacheModeFilter, RunMode};
pub use metadata::RunMetadata;
pub use rgroup::{load_resource_groups, parse_resource_groups, ResourceGroupSpec, ResourceGroups};
pub use workload::{
    load_workloads, parse_workloads, EffectivePhase, IoPattern, LegacyParams, PhaseSpec,
    WorkloadSpec, Workloads,
};

lazy_static::lazy_static! {
    pub static ref VERSION: &'static str = env!("CARGO_PKG_VERSION");
}

/// Errors from reading workload and resource group configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?} ({source})")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no workload defined")]
    NoWorkloads,
    #[error("line {line}: [{section}] {key}={value:?}: {reason}")]
    InvalidValue {
        line: usize,
        section: String,
        key: String,
        value: String,
        reason: String,
    },
    #[error("[{section}] phase {phase} is missing phase_{phase}_{param}")]
    MissingPhaseParam {
        section: String,
        phase: u32,
        param: &'static str,
    },
    #[error("line {line}: [{section}] duplicate knob {knob:?}")]
    DuplicateKnob {
        line: usize,
        section: String,
        knob: String,
    },
}
