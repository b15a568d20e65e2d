// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Child;

use super::launcher::{Launch, Launcher, Output};
use super::run::RunCtx;

/// A system monitor running in the background. Terminated with SIGTERM when
/// dropped.
pub struct Monitor {
    child: Child,
    log: PathBuf,
}

impl Monitor {
    pub fn start(launcher: &dyn Launcher, launch: Launch) -> Result<Self> {
        let log = match &launch.stdout {
            Output::File(path) => path.clone(),
            _ => PathBuf::new(),
        };
        let child = launcher.spawn(&launch)?;
        debug!("monitor: started {} ({})", &launch, child.id());
        Ok(Self { child, log })
    }

    pub fn iostat_launch(iostat: &Path, log: PathBuf) -> Launch {
        Launch::new(
            iostat,
            vec!["-d".into(), "-x".into(), "1".into()],
        )
        .stdout(Output::File(log))
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let pid = Pid::from_raw(self.child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!("monitor: failed to signal {} ({})", pid, &e);
        }
        let _ = self.child.wait();
        debug!("monitor: stopped, log at {:?}", &self.log);
    }
}

/// Start iostat logging to `iostat/<log_name>` if iostat is available.
pub fn start_iostat(rctx: &RunCtx, log_name: &str) -> Option<Monitor> {
    let iostat = rctx.iostat.as_ref()?;
    let log = rctx.iostat_dir().join(log_name);
    match Monitor::start(&*rctx.launcher, Monitor::iostat_launch(iostat, log)) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("monitor: failed to start iostat ({:#})", &e);
            None
        }
    }
}
