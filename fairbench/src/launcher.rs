// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::trace;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

/// Where a launched process's stdout goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Inherit,
    Null,
    File(PathBuf),
}

/// A fully specified process invocation. Arguments are passed as a list and
/// never go through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdout: Output,
}

impl Launch {
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stdout: Output::Inherit,
        }
    }

    pub fn stdout(mut self, stdout: Output) -> Self {
        self.stdout = stdout;
        self
    }

    /// Value of a `--key=value` argument.
    pub fn arg_value(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix.as_str()))
    }

    fn command(&self) -> Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        match &self.stdout {
            Output::Inherit => {}
            Output::Null => {
                cmd.stdout(Stdio::null());
            }
            Output::File(path) => {
                let f = fs::File::create(path)
                    .with_context(|| format!("creating {:?}", path))?;
                cmd.stdout(f);
            }
        }
        Ok(cmd)
    }
}

impl fmt::Display for Launch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.args.iter() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

pub trait Launcher {
    /// Run to completion and return the exit status.
    fn run(&self, launch: &Launch) -> Result<ExitStatus>;
    /// Start in the background.
    fn spawn(&self, launch: &Launch) -> Result<Child>;
}

pub struct SysLauncher;

impl Launcher for SysLauncher {
    fn run(&self, launch: &Launch) -> Result<ExitStatus> {
        trace!("launcher: running {}", launch);
        launch
            .command()?
            .status()
            .with_context(|| format!("running {:?}", &launch.program))
    }

    fn spawn(&self, launch: &Launch) -> Result<Child> {
        trace!("launcher: spawning {}", launch);
        launch
            .command()?
            .spawn()
            .with_context(|| format!("spawning {:?}", &launch.program))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::bail;
    use std::collections::BTreeMap;
    use std::os::unix::process::ExitStatusExt;
    use std::sync::{Arc, Mutex};

    /// Records invocations and plays fio by writing `--output` files. Clones
    /// share the records.
    #[derive(Clone)]
    pub struct FakeLauncher {
        pub runs: Arc<Mutex<Vec<Launch>>>,
        pub spawns: Arc<Mutex<Vec<Launch>>>,
        /// Invocations whose `--name` matches leave an empty output.
        pub empty_outputs: Vec<String>,
        /// Spawns whose `--client-proc` is listed start a real process that
        /// exits successfully or not per the value. Others fail to spawn.
        pub spawn_exits: BTreeMap<String, bool>,
        pub spawned_pids: Arc<Mutex<Vec<u32>>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self {
                runs: Arc::new(Mutex::new(vec![])),
                spawns: Arc::new(Mutex::new(vec![])),
                empty_outputs: vec![],
                spawn_exits: BTreeMap::new(),
                spawned_pids: Arc::new(Mutex::new(vec![])),
            }
        }
    }

    impl Launcher for FakeLauncher {
        fn run(&self, launch: &Launch) -> Result<ExitStatus> {
            if let Some(out) = launch.arg_value("--output") {
                let empty = launch
                    .arg_value("--name")
                    .map(|name| self.empty_outputs.iter().any(|e| e == name))
                    .unwrap_or(false);
                fs::write(out, if empty { "" } else { "{\"jobs\": []}\n" })?;
            }
            self.runs.lock().unwrap().push(launch.clone());
            Ok(ExitStatus::from_raw(0))
        }

        fn spawn(&self, launch: &Launch) -> Result<Child> {
            self.spawns.lock().unwrap().push(launch.clone());
            let exit_ok = launch
                .arg_value("--client-proc")
                .and_then(|client| self.spawn_exits.get(client).copied());
            match exit_ok {
                Some(ok) => {
                    let child = Command::new(if ok { "true" } else { "false" }).spawn()?;
                    self.spawned_pids.lock().unwrap().push(child.id());
                    Ok(child)
                }
                None => bail!("spawning is not supported by FakeLauncher"),
            }
        }
    }

    #[test]
    fn test_launch() {
        let launch = Launch::new(
            "/usr/bin/fio",
            vec!["--name=w".into(), "--output=/tmp/w.json".into()],
        )
        .stdout(Output::Null);
        assert_eq!(launch.arg_value("--output"), Some("/tmp/w.json"));
        assert_eq!(launch.arg_value("--size"), None);
        assert_eq!(
            format!("{}", &launch),
            "/usr/bin/fio --name=w --output=/tmp/w.json"
        );
    }

    #[test]
    fn test_sys_launcher_output_file() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("echo.out");
        let launch = Launch::new("echo", vec!["hello".into()]).stdout(Output::File(out.clone()));
        let status = SysLauncher.run(&launch).unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
    }
}
