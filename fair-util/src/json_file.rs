// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// JSON text with comment lines blanked out. Lines are kept so that parse
/// errors point at the right line.
fn strip_comment_lines(text: &str) -> String {
    let mut body = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with("//") && !trimmed.starts_with('#') {
            body += line;
        }
        body.push('\n');
    }
    body
}

pub trait JsonLoad: DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        serde_json::from_str(&strip_comment_lines(&text))
            .with_context(|| format!("parsing {:?}", path))
    }
}

pub trait JsonSave: Default + Serialize {
    /// Comment block written above the JSON body.
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut out = Self::preamble().unwrap_or_default();
        out += &serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.as_json()?).with_context(|| format!("writing {:?}", path))
    }

    /// Write the default value to `path` unless it already exists. Returns
    /// whether a new file was created.
    fn create_default<P: AsRef<Path>>(path: P) -> Result<bool> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
        }
        let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("creating {:?}", path)),
        };
        f.write_all(Self::default().as_json()?.as_bytes())?;
        Ok(true)
    }
}

/// Arguments and the optional `--args` file they were based on.
#[derive(Clone, Debug)]
pub struct ArgsFile<T> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave> ArgsFile<T> {
    /// Load base arguments from `path`, creating it with the defaults if
    /// missing. Without a path, start from the defaults.
    pub fn open<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let path = match path {
            Some(v) => v.as_ref().to_path_buf(),
            None => {
                return Ok(Self {
                    path: None,
                    data: T::default(),
                })
            }
        };
        if T::create_default(&path)? {
            info!("Created args file {:?}", &path);
        }
        Ok(Self {
            data: T::load(&path)?,
            path: Some(path),
        })
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_ref() {
            Some(path) => self.data.save(path),
            None => Ok(()),
        }
    }
}

/// Command line arguments whose base values can come from an args file.
pub trait JsonArgs: JsonLoad + JsonSave {
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    /// Apply `matches` on top of the loaded values. Returns whether the
    /// args file should be rewritten.
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> bool;
}

pub trait JsonArgsHelper: JsonArgs {
    fn init_args_and_logging_nosave() -> Result<(ArgsFile<Self>, bool)>;
    fn save_args(args_file: &ArgsFile<Self>) -> Result<()>;
}

impl<T: JsonArgs> JsonArgsHelper for T {
    fn init_args_and_logging_nosave() -> Result<(ArgsFile<T>, bool)> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = ArgsFile::<T>::open(matches.value_of("args"))?;
        let updated = args_file.data.process_cmdline(&matches);
        Ok((args_file, updated))
    }

    fn save_args(args_file: &ArgsFile<T>) -> Result<()> {
        if let Some(path) = args_file.path.as_ref() {
            info!("Updating args file {:?}", path);
            args_file.save()?;
        }
        Ok(())
    }
}
