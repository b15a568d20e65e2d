// Copyright (c) Facebook, Inc. and its affiliates.
use clap::{App, AppSettings, Arg, ArgMatches};
use lazy_static::lazy_static;
use log::error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::exit;
use std::str::FromStr;

use fair_util::*;

const HELP_BODY: &str = "\
Page-cache fairness benchmark orchestrator.

fairbench runs fio workloads described in an INI-like configuration file,
optionally inside cgroup v2 resource groups, once per cache mode. MODE selects
what runs:

 * dual - the two client workloads run concurrently, each in its own
   resource group, to observe cross-client fairness (default).

 * all - every configured workload runs sequentially.

 * WORKLOAD - only the named workload runs.

Workloads with phase_<N>_<param> keys run their phases in order without
resetting the page cache in between. Results, iostat logs, metadata.json and
summary.txt are written to the output directory, which is reset on each run.
";

const ARGS_DOC: &str = "\
//
// fairbench command line arguments
//
// This file provides the base values for a subset of command line arguments.
// They can be overridden from command line.
//
";

lazy_static! {
    static ref ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "[MODE]                        'dual, all or a workload name (default: {dfl_mode})'
             -c, --config=[FILE]           'Workload configuration (default: {dfl_config})'
             -g, --cgroup-config=[FILE]    'Resource group configuration (default: {dfl_cgroup_config})'
             -o, --output=[DIR]            'Output directory, reset on each run (default: {dfl_output})'
             -m, --cache-modes=[MODES]     'cached, direct or both (default: {dfl_cache_modes})'
             -t, --testfile-dir=[DIR]      'Directory for the backing test files (default: {dfl_testfile_dir})'
                 --clients=[A,B]           'Client workloads for dual mode (default: {dfl_clients})'
                 --cgroup-root=[DIR]       'cgroup v2 mount point (default: {dfl_cgroup_root})'
                 --fio=[PATH]              'fio binary to use instead of searching PATH'
             -a, --args=[FILE]             'Load base command line arguments from FILE'
                 --no-cgroups              'Disable resource isolation'
                 --keep-cgroups            'Leave resource groups in place at the end of the run'
             -v...                         'Sets the level of verbosity'",
            dfl_mode = dfl.mode,
            dfl_config = dfl.config,
            dfl_cgroup_config = dfl.cgroup_config,
            dfl_output = dfl.output,
            dfl_cache_modes = dfl.cache_modes,
            dfl_testfile_dir = dfl.testfile_dir,
            dfl_clients = dfl.clients.join(","),
            dfl_cgroup_root = dfl.cgroup_root,
        )
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Dual,
    All,
    Workload(String),
}

impl RunMode {
    pub fn parse(input: &str) -> Self {
        match input {
            "dual" => Self::Dual,
            "all" => Self::All,
            name => Self::Workload(name.to_string()),
        }
    }

    /// Run type recorded in the run metadata.
    pub fn run_type(&self) -> &'static str {
        match self {
            Self::Dual => "concurrent",
            Self::All => "all_workloads",
            Self::Workload(_) => "single_workload",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Dual => write!(f, "dual"),
            Self::All => write!(f, "all"),
            Self::Workload(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheMode {
    Cached,
    Direct,
}

impl CacheMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Direct => "direct",
        }
    }

    pub fn is_direct(&self) -> bool {
        *self == Self::Direct
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, String> {
        match input {
            "cached" => Ok(Self::Cached),
            "direct" => Ok(Self::Direct),
            v => Err(format!("invalid cache mode {:?}, expected cached or direct", v)),
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheModeFilter {
    Cached,
    Direct,
    Both,
}

impl CacheModeFilter {
    /// Cache modes to run, in execution order.
    pub fn modes(&self) -> Vec<CacheMode> {
        match self {
            Self::Cached => vec![CacheMode::Cached],
            Self::Direct => vec![CacheMode::Direct],
            Self::Both => vec![CacheMode::Cached, CacheMode::Direct],
        }
    }
}

impl FromStr for CacheModeFilter {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, String> {
        match input {
            "cached" => Ok(Self::Cached),
            "direct" => Ok(Self::Direct),
            "both" => Ok(Self::Both),
            v => Err(format!(
                "invalid cache modes {:?}, expected cached, direct or both",
                v
            )),
        }
    }
}

impl fmt::Display for CacheModeFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Cached => write!(f, "cached"),
            Self::Direct => write!(f, "direct"),
            Self::Both => write!(f, "both"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub mode: RunMode,
    pub config: String,
    pub cgroup_config: String,
    pub output: String,
    pub cache_modes: CacheModeFilter,
    pub testfile_dir: String,
    pub clients: Vec<String>,
    pub cgroup_root: String,
    pub fio: Option<String>,

    #[serde(skip)]
    pub no_cgroups: bool,
    #[serde(skip)]
    pub keep_cgroups: bool,
    #[serde(skip)]
    pub verbosity: u32,
    #[serde(skip)]
    pub client_proc: Option<String>,
    #[serde(skip)]
    pub client_cache_mode: Option<CacheMode>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            mode: RunMode::Dual,
            config: "fairness_configs.ini".into(),
            cgroup_config: "cgroup_config.ini".into(),
            output: "fairness_results".into(),
            cache_modes: CacheModeFilter::Both,
            testfile_dir: ".".into(),
            clients: vec!["client1_steady".into(), "client2_bursty".into()],
            cgroup_root: "/sys/fs/cgroup".into(),
            fio: None,
            no_cgroups: false,
            keep_cgroups: false,
            verbosity: 0,
            client_proc: None,
            client_cache_mode: None,
        }
    }
}

impl Args {
    pub fn parse_clients(input: &str) -> Result<Vec<String>, String> {
        let clients: Vec<String> = input
            .split(',')
            .map(|c| c.trim().to_string())
            .collect();
        if clients.len() != 2 || clients.iter().any(|c| c.is_empty()) {
            return Err(format!("{:?} must name exactly two clients", input));
        }
        if clients[0] == clients[1] {
            return Err(format!("{:?} names the same client twice", input));
        }
        Ok(clients)
    }

    /// Arguments for a spawned client process running `client` for one
    /// cache mode. Every option which affects the client's behavior is
    /// passed explicitly so that the child doesn't depend on `--args`.
    pub fn client_proc_args(&self, client: &str, cache_mode: CacheMode, fio: &Path) -> Vec<String> {
        let mut args = vec![
            format!("--config={}", &self.config),
            format!("--cgroup-config={}", &self.cgroup_config),
            format!("--output={}", &self.output),
            format!("--testfile-dir={}", &self.testfile_dir),
            format!("--cgroup-root={}", &self.cgroup_root),
            format!("--fio={}", fio.display()),
            format!("--client-proc={}", client),
            format!("--cache-mode={}", cache_mode.name()),
        ];
        if self.no_cgroups {
            args.push("--no-cgroups".into());
        }
        if self.verbosity > 0 {
            args.push(format!("-{}", "v".repeat(self.verbosity as usize)));
        }
        args
    }
}

fn parse_or_exit<T: FromStr<Err = String>>(input: &str) -> T {
    match input.parse::<T>() {
        Ok(v) => v,
        Err(e) => {
            error!("{}", &e);
            exit(1);
        }
    }
}

impl JsonLoad for Args {}

impl JsonSave for Args {
    fn preamble() -> Option<String> {
        Some(ARGS_DOC.to_string())
    }
}

impl JsonArgs for Args {
    #[allow(dangerous_implicit_autorefs)]
    fn match_cmdline() -> ArgMatches<'static> {
        App::new("fairbench")
            .version(*super::VERSION)
            .author(clap::crate_authors!("\n"))
            .about(HELP_BODY)
            .args_from_usage(&ARGS_STR)
            .arg(
                Arg::with_name("client-proc")
                    .long("client-proc")
                    .takes_value(true)
                    .hidden(true),
            )
            .arg(
                Arg::with_name("cache-mode")
                    .long("cache-mode")
                    .takes_value(true)
                    .requires("client-proc")
                    .hidden(true),
            )
            .setting(AppSettings::UnifiedHelpMessage)
            .setting(AppSettings::DeriveDisplayOrder)
            .get_matches()
    }

    fn verbosity(matches: &ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &ArgMatches) -> bool {
        let dfl = Args::default();
        let mut updated_base = false;

        if let Some(v) = matches.value_of("MODE") {
            self.mode = if v.len() > 0 {
                RunMode::parse(v)
            } else {
                dfl.mode.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("config") {
            self.config = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.config.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("cgroup-config") {
            self.cgroup_config = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.cgroup_config.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("output") {
            self.output = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.output.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("cache-modes") {
            self.cache_modes = if v.len() > 0 {
                parse_or_exit(v)
            } else {
                dfl.cache_modes
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("testfile-dir") {
            self.testfile_dir = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.testfile_dir.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("clients") {
            self.clients = if v.len() > 0 {
                match Self::parse_clients(v) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("--clients: {}", &e);
                        exit(1);
                    }
                }
            } else {
                dfl.clients.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("cgroup-root") {
            self.cgroup_root = if v.len() > 0 {
                v.to_string()
            } else {
                dfl.cgroup_root.clone()
            };
            updated_base = true;
        }
        if let Some(v) = matches.value_of("fio") {
            self.fio = if v.len() > 0 {
                Some(v.to_string())
            } else {
                None
            };
            updated_base = true;
        }

        self.no_cgroups = matches.is_present("no-cgroups");
        self.keep_cgroups = matches.is_present("keep-cgroups");
        self.verbosity = Self::verbosity(matches);
        self.client_proc = matches.value_of("client-proc").map(|x| x.to_string());
        self.client_cache_mode = matches.value_of("cache-mode").map(|v| parse_or_exit(v));
        if self.client_proc.is_some() && self.client_cache_mode.is_none() {
            error!("--client-proc requires --cache-mode");
            exit(1);
        }

        // A hand-edited args file can carry any number of clients.
        if self.clients.len() != 2 {
            error!("args: clients must name exactly two workloads");
            exit(1);
        }

        // Spawned clients never update the shared args file.
        updated_base && self.client_proc.is_none()
    }
}
