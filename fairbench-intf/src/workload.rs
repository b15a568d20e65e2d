// Copyright (c) Facebook, Inc. and its affiliates.
use fair_util::parse_size;
use lazy_static::lazy_static;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::ini::{parse_sections, IniEntry, IniSection};
use super::ConfigError;

lazy_static! {
    static ref PATTERN_ALIASES: BTreeMap<&'static str, IoPattern> = [
        ("read", IoPattern::Read),
        ("seqread", IoPattern::Read),
        ("sequential-read", IoPattern::Read),
        ("write", IoPattern::Write),
        ("seqwrite", IoPattern::Write),
        ("sequential-write", IoPattern::Write),
        ("randread", IoPattern::RandRead),
        ("random-read", IoPattern::RandRead),
        ("randwrite", IoPattern::RandWrite),
        ("random-write", IoPattern::RandWrite),
        ("rw", IoPattern::ReadWrite),
        ("readwrite", IoPattern::ReadWrite),
        ("sequential-readwrite", IoPattern::ReadWrite),
        ("randrw", IoPattern::RandReadWrite),
        ("random-readwrite", IoPattern::RandReadWrite),
    ]
    .iter()
    .cloned()
    .collect();
}

/// Access pattern of a load-generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoPattern {
    Read,
    Write,
    RandRead,
    RandWrite,
    ReadWrite,
    RandReadWrite,
}

impl IoPattern {
    /// Name the load generator understands.
    pub fn fio_name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::RandRead => "randread",
            Self::RandWrite => "randwrite",
            Self::ReadWrite => "rw",
            Self::RandReadWrite => "randrw",
        }
    }
}

impl FromStr for IoPattern {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, String> {
        let key = input.trim().to_ascii_lowercase().replace('_', "-");
        PATTERN_ALIASES.get(key.as_str()).cloned().ok_or_else(|| {
            format!(
                "unknown access pattern, expected one of {}",
                PATTERN_ALIASES.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }
}

impl fmt::Display for IoPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.fio_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub number: u32,
    pub runtime: u32,
    pub block_size: String,
    pub iodepth: u32,
    pub pattern: IoPattern,
    pub ioengine: Option<String>,
    /// 0 inherits the workload's numjobs.
    pub numjobs: u32,
    /// None inherits the workload's file size.
    pub file_size: Option<String>,
    /// 0 inherits the workload's rate limit.
    pub rate_iops: u32,
}

/// Parameters of the single load-generator run used when a workload has no
/// phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyParams {
    pub block_size: String,
    pub runtime: u32,
    pub iodepth: u32,
    pub pattern: IoPattern,
    pub ioengine: Option<String>,
}

impl Default for LegacyParams {
    fn default() -> Self {
        Self {
            block_size: "4k".into(),
            runtime: 60,
            iodepth: 1,
            pattern: IoPattern::RandRead,
            ioengine: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub description: String,
    pub file_size: String,
    pub numjobs: u32,
    /// 0 means unlimited.
    pub rate_iops: u32,
    pub legacy: LegacyParams,
    /// Sorted by phase number. Empty selects the legacy single-phase mode.
    pub phases: Vec<PhaseSpec>,
}

/// Fully resolved parameters of one load-generator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePhase {
    /// None for the legacy single-phase run.
    pub number: Option<u32>,
    pub runtime: u32,
    pub block_size: String,
    pub iodepth: u32,
    pub pattern: IoPattern,
    pub ioengine: Option<String>,
    pub numjobs: u32,
    pub file_size: String,
    pub rate_iops: Option<u32>,
}

impl WorkloadSpec {
    pub const DFL_FILE_SIZE: &'static str = "1G";
    pub const DFL_NUMJOBS: u32 = 1;

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            file_size: Self::DFL_FILE_SIZE.into(),
            numjobs: Self::DFL_NUMJOBS,
            rate_iops: 0,
            legacy: Default::default(),
            phases: vec![],
        }
    }

    pub fn is_multi_phase(&self) -> bool {
        !self.phases.is_empty()
    }

    pub fn effective_phase(&self, phase: &PhaseSpec) -> EffectivePhase {
        let rate_iops = match phase.rate_iops {
            0 => self.rate_iops,
            v => v,
        };
        EffectivePhase {
            number: Some(phase.number),
            runtime: phase.runtime,
            block_size: phase.block_size.clone(),
            iodepth: phase.iodepth,
            pattern: phase.pattern,
            ioengine: phase
                .ioengine
                .clone()
                .or_else(|| self.legacy.ioengine.clone()),
            numjobs: match phase.numjobs {
                0 => self.numjobs,
                v => v,
            },
            file_size: phase
                .file_size
                .clone()
                .unwrap_or_else(|| self.file_size.clone()),
            rate_iops: if rate_iops > 0 { Some(rate_iops) } else { None },
        }
    }

    pub fn legacy_phase(&self) -> EffectivePhase {
        EffectivePhase {
            number: None,
            runtime: self.legacy.runtime,
            block_size: self.legacy.block_size.clone(),
            iodepth: self.legacy.iodepth,
            pattern: self.legacy.pattern,
            ioengine: self.legacy.ioengine.clone(),
            numjobs: self.numjobs,
            file_size: self.file_size.clone(),
            rate_iops: if self.rate_iops > 0 {
                Some(self.rate_iops)
            } else {
                None
            },
        }
    }

    /// Everything the workload launches in execution order.
    pub fn effective_phases(&self) -> Vec<EffectivePhase> {
        if self.is_multi_phase() {
            self.phases.iter().map(|p| self.effective_phase(p)).collect()
        } else {
            vec![self.legacy_phase()]
        }
    }

    /// Distinct backing file sizes the workload needs.
    pub fn file_sizes(&self) -> BTreeSet<String> {
        self.effective_phases()
            .into_iter()
            .map(|p| p.file_size)
            .collect()
    }

    /// Phase numbers missing from the 1..=max sequence.
    pub fn phase_gaps(&self) -> Vec<u32> {
        let present: BTreeSet<u32> = self.phases.iter().map(|p| p.number).collect();
        match present.iter().next_back() {
            Some(&max) => (1..=max).filter(|n| !present.contains(n)).collect(),
            None => vec![],
        }
    }
}

pub type Workloads = BTreeMap<String, WorkloadSpec>;

fn invalid(sect: &IniSection, ent: &IniEntry, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        line: ent.line,
        section: sect.name.clone(),
        key: ent.key.clone(),
        value: ent.value.clone(),
        reason,
    }
}

fn parse_u32(sect: &IniSection, ent: &IniEntry) -> Result<u32, ConfigError> {
    ent.value
        .parse::<u32>()
        .map_err(|e| invalid(sect, ent, format!("{}", &e)))
}

/// Like parse_u32 but for values fio can't take as zero.
fn parse_positive(sect: &IniSection, ent: &IniEntry) -> Result<u32, ConfigError> {
    match parse_u32(sect, ent)? {
        0 => Err(invalid(sect, ent, "must be positive".into())),
        v => Ok(v),
    }
}

fn parse_pattern(sect: &IniSection, ent: &IniEntry) -> Result<IoPattern, ConfigError> {
    ent.value
        .parse::<IoPattern>()
        .map_err(|e| invalid(sect, ent, e))
}

fn parse_block_size(sect: &IniSection, ent: &IniEntry) -> Result<String, ConfigError> {
    match parse_size(&ent.value) {
        Ok(v) if v > 0 => Ok(ent.value.clone()),
        Ok(_) => Err(invalid(sect, ent, "block size must be positive".into())),
        Err(e) => Err(invalid(sect, ent, format!("{}", &e))),
    }
}

fn opt_string(value: &str) -> Option<String> {
    match value {
        "" => None,
        v => Some(v.to_string()),
    }
}

const PHASE_PARAMS: &[&str] = &[
    "runtime",
    "block_size",
    "iodepth",
    "pattern",
    "ioengine",
    "numjobs",
    "file_size",
    "rate_iops",
];

/// Split `phase_<N>_<param>` into its number and parameter name. Keys with
/// an unknown `<param>` are not phase keys.
fn split_phase_key(key: &str) -> Option<(u32, &str)> {
    let rest = key.strip_prefix("phase_")?;
    let (nr, param) = rest.split_once('_')?;
    if !PHASE_PARAMS.contains(&param) {
        return None;
    }
    match nr.parse::<u32>() {
        Ok(nr) if nr > 0 => Some((nr, param)),
        _ => None,
    }
}

#[derive(Default)]
struct PhaseAccum {
    runtime: Option<u32>,
    block_size: Option<String>,
    iodepth: Option<u32>,
    pattern: Option<IoPattern>,
    ioengine: Option<String>,
    numjobs: u32,
    file_size: Option<String>,
    rate_iops: u32,
}

impl PhaseAccum {
    fn set(&mut self, sect: &IniSection, ent: &IniEntry, param: &str) -> Result<(), ConfigError> {
        match param {
            "runtime" => self.runtime = Some(parse_positive(sect, ent)?),
            "block_size" => self.block_size = Some(parse_block_size(sect, ent)?),
            "iodepth" => self.iodepth = Some(parse_positive(sect, ent)?),
            "pattern" => self.pattern = Some(parse_pattern(sect, ent)?),
            "ioengine" => self.ioengine = opt_string(&ent.value),
            "numjobs" => self.numjobs = parse_u32(sect, ent)?,
            "file_size" => self.file_size = opt_string(&ent.value),
            "rate_iops" => self.rate_iops = parse_u32(sect, ent)?,
            _ => (),
        }
        Ok(())
    }

    fn finish(self, section: &str, number: u32) -> Result<PhaseSpec, ConfigError> {
        let missing = |param: &'static str| ConfigError::MissingPhaseParam {
            section: section.to_string(),
            phase: number,
            param,
        };
        Ok(PhaseSpec {
            number,
            runtime: self.runtime.ok_or_else(|| missing("runtime"))?,
            block_size: self.block_size.ok_or_else(|| missing("block_size"))?,
            iodepth: self.iodepth.ok_or_else(|| missing("iodepth"))?,
            pattern: self.pattern.ok_or_else(|| missing("pattern"))?,
            ioengine: self.ioengine,
            numjobs: self.numjobs,
            file_size: self.file_size,
            rate_iops: self.rate_iops,
        })
    }
}

fn build_workload(sect: &IniSection) -> Result<WorkloadSpec, ConfigError> {
    let mut wl = WorkloadSpec::new(&sect.name);
    let dfl = WorkloadSpec::new(&sect.name);
    let mut phase_accums = BTreeMap::<u32, PhaseAccum>::new();

    for ent in sect.entries.iter() {
        if let Some((nr, param)) = split_phase_key(&ent.key) {
            phase_accums
                .entry(nr)
                .or_default()
                .set(sect, ent, param)?;
            continue;
        }

        // Empty values reset the key to its default.
        let empty = ent.value.is_empty();
        match ent.key.as_str() {
            "description" => wl.description = ent.value.clone(),
            "file_size" if empty => wl.file_size = dfl.file_size.clone(),
            "file_size" => wl.file_size = ent.value.clone(),
            "numjobs" if empty => wl.numjobs = dfl.numjobs,
            "numjobs" => wl.numjobs = parse_u32(sect, ent)?.max(1),
            "rate_iops" if empty => wl.rate_iops = 0,
            "rate_iops" => wl.rate_iops = parse_u32(sect, ent)?,
            "block_size" if empty => wl.legacy.block_size = dfl.legacy.block_size.clone(),
            "block_size" => wl.legacy.block_size = parse_block_size(sect, ent)?,
            "runtime" if empty => wl.legacy.runtime = dfl.legacy.runtime,
            "runtime" => wl.legacy.runtime = parse_positive(sect, ent)?,
            "iodepth" if empty => wl.legacy.iodepth = dfl.legacy.iodepth,
            "iodepth" => wl.legacy.iodepth = parse_positive(sect, ent)?,
            "pattern" if empty => wl.legacy.pattern = dfl.legacy.pattern,
            "pattern" => wl.legacy.pattern = parse_pattern(sect, ent)?,
            "ioengine" => wl.legacy.ioengine = opt_string(&ent.value),
            _ => (),
        }
    }

    for (nr, accum) in phase_accums.into_iter() {
        wl.phases.push(accum.finish(&sect.name, nr)?);
    }

    let gaps = wl.phase_gaps();
    if !gaps.is_empty() {
        warn!(
            "config: [{}] phase numbers are not contiguous, missing {:?}",
            &wl.name, &gaps
        );
    }

    Ok(wl)
}

/// Parse workload definitions. Each `[name]` section is one workload, later
/// sections with the same name replace earlier ones.
pub fn parse_workloads(text: &str) -> Result<Workloads, ConfigError> {
    let mut workloads = Workloads::new();
    for sect in parse_sections(text).iter() {
        let wl = build_workload(sect)?;
        if workloads.insert(wl.name.clone(), wl).is_some() {
            warn!(
                "config: line {}: [{}] redefined, using the latter",
                sect.line, &sect.name
            );
        }
    }
    if workloads.is_empty() {
        return Err(ConfigError::NoWorkloads);
    }
    Ok(workloads)
}

pub fn load_workloads<P: AsRef<Path>>(path: P) -> Result<Workloads, ConfigError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse_workloads(&text)
}
