// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use fair_util::*;
use fairbench_intf::{ResourceGroupSpec, ResourceGroups};

/// Controllers every group gets regardless of its knobs.
const BASE_CONTROLLERS: &[&str] = &["cpu", "memory", "io"];

/// Host-specific side of resource groups. Group names are paths relative to
/// the isolation root, "" being the root itself.
pub trait IsolationBackend {
    fn exists(&self, group: &str) -> bool;
    /// Create `group` and any missing parents.
    fn create(&self, group: &str) -> Result<()>;
    /// Returns false if `ctrl` was already enabled for `group`'s children.
    fn enable_controller(&self, group: &str, ctrl: &str) -> Result<bool>;
    fn write_knob(&self, group: &str, knob: &str, value: &str) -> Result<()>;
    fn attach(&self, group: &str, pid: u32) -> Result<()>;
    /// Kill every process in `group` and its descendants, returns how many
    /// were signaled.
    fn kill_members(&self, group: &str) -> Result<usize>;
    /// Remove `group` and its descendants, which must be empty.
    fn remove(&self, group: &str) -> Result<()>;
    /// Remove `group` only if it has no child groups.
    fn remove_empty(&self, group: &str) -> Result<()>;
}

/// cgroup v2 through its filesystem interface.
pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    const RMDIR_RETRIES: u32 = 20;
    const RMDIR_RETRY_INTV: Duration = Duration::from_millis(50);

    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.root.join("cgroup.controllers").exists()
    }

    fn path(&self, group: &str) -> PathBuf {
        if group.is_empty() {
            self.root.clone()
        } else {
            self.root.join(group)
        }
    }

    fn child_dirs(path: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = vec![];
        for entry in path.read_dir()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn collect_pids(path: &Path, pids: &mut Vec<i32>) -> Result<()> {
        pids.append(&mut read_pid_list(path.join("cgroup.procs"))?);
        for child in Self::child_dirs(path)? {
            Self::collect_pids(&child, pids)?;
        }
        Ok(())
    }

    fn rmdir_with_retries(path: &Path) -> Result<()> {
        let mut tries = 0;
        loop {
            match fs::remove_dir(path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                // Killed members take a moment to leave.
                Err(e) if tries < Self::RMDIR_RETRIES && e.raw_os_error() == Some(libc::EBUSY) => {
                    tries += 1;
                    sleep(Self::RMDIR_RETRY_INTV);
                }
                Err(e) => return Err(e).with_context(|| format!("removing {:?}", path)),
            }
        }
    }

    fn remove_tree(path: &Path) -> Result<()> {
        for child in Self::child_dirs(path)? {
            Self::remove_tree(&child)?;
        }
        Self::rmdir_with_retries(path)
    }
}

impl IsolationBackend for CgroupV2 {
    fn exists(&self, group: &str) -> bool {
        self.path(group).is_dir()
    }

    fn create(&self, group: &str) -> Result<()> {
        let path = self.path(group);
        fs::create_dir_all(&path).with_context(|| format!("creating {:?}", &path))
    }

    fn enable_controller(&self, group: &str, ctrl: &str) -> Result<bool> {
        let path = self.path(group).join("cgroup.subtree_control");
        let line = read_one_line(&path).unwrap_or_default();
        if line.split_whitespace().any(|c| c == ctrl) {
            return Ok(false);
        }
        write_one_line(&path, &format!("+{}", ctrl))
            .with_context(|| format!("enabling {:?} in {:?}", ctrl, &path))?;
        Ok(true)
    }

    fn write_knob(&self, group: &str, knob: &str, value: &str) -> Result<()> {
        let path = self.path(group).join(knob);
        if !path.exists() {
            bail!("{:?} is not available", knob);
        }
        write_one_line(&path, value).with_context(|| format!("writing {:?} to {:?}", value, &path))
    }

    fn attach(&self, group: &str, pid: u32) -> Result<()> {
        let path = self.path(group).join("cgroup.procs");
        write_one_line(&path, &pid.to_string())
            .with_context(|| format!("writing {} to {:?}", pid, &path))
    }

    fn kill_members(&self, group: &str) -> Result<usize> {
        let path = self.path(group);
        let mut pids = vec![];
        Self::collect_pids(&path, &mut pids)?;
        if pids.is_empty() {
            return Ok(0);
        }

        let kill_path = path.join("cgroup.kill");
        if kill_path.exists() && write_one_line(&kill_path, "1").is_ok() {
            return Ok(pids.len());
        }

        for pid in pids.iter() {
            if let Err(e) = kill(Pid::from_raw(*pid), Signal::SIGKILL) {
                debug!("cgroup: failed to kill {} in {:?} ({})", pid, group, &e);
            }
        }
        Ok(pids.len())
    }

    fn remove(&self, group: &str) -> Result<()> {
        if group.is_empty() {
            bail!("refusing to remove the cgroup root");
        }
        Self::remove_tree(&self.path(group))
    }

    fn remove_empty(&self, group: &str) -> Result<()> {
        if group.is_empty() {
            bail!("refusing to remove the cgroup root");
        }
        let path = self.path(group);
        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {:?}", &path)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnobFailure {
    pub knob: String,
    pub reason: String,
}

/// Outcome of applying one group's knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnobReport {
    pub applied: Vec<String>,
    pub failed: Vec<KnobFailure>,
}

impl KnobReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// The client has no resource group configured.
    NoGroup,
    Failed(String),
}

/// Proper ancestors of `group` from the root down, "" being the root.
fn ancestors(group: &str) -> Vec<String> {
    let mut ancs = vec![String::new()];
    let segs: Vec<&str> = group.split('/').collect();
    for i in 1..segs.len() {
        ancs.push(segs[..i].join("/"));
    }
    ancs
}

/// Materializes ResourceGroupSpecs through an IsolationBackend. Everything
/// here is best-effort; failures are logged and reported, never fatal.
pub struct ResourceGroupController {
    backend: Box<dyn IsolationBackend>,
    groups: ResourceGroups,
    /// Intermediate groups this controller created.
    created_parents: BTreeSet<String>,
}

impl ResourceGroupController {
    pub fn new(backend: Box<dyn IsolationBackend>, groups: ResourceGroups) -> Self {
        Self {
            backend,
            groups,
            created_parents: BTreeSet::new(),
        }
    }

    fn spec(&self, client: &str) -> Result<&ResourceGroupSpec> {
        self.groups
            .get(client)
            .ok_or_else(|| anyhow!("no resource group for {:?}", client))
    }

    /// Remove the group left over from an earlier setup, killing its
    /// members first.
    fn clear(&self, spec: &ResourceGroupSpec) -> Result<()> {
        if !self.backend.exists(&spec.cgroup_name) {
            return Ok(());
        }
        let nr_killed = self.backend.kill_members(&spec.cgroup_name)?;
        if nr_killed > 0 {
            info!(
                "cgroup: killed {} residual processes in {:?}",
                nr_killed, &spec.cgroup_name
            );
        }
        debug!("cgroup: removing {:?}", &spec.cgroup_name);
        self.backend.remove(&spec.cgroup_name)
    }

    fn enable_controllers(&self, spec: &ResourceGroupSpec) {
        let mut ctrls: Vec<String> = BASE_CONTROLLERS.iter().map(|c| c.to_string()).collect();
        for ctrl in spec.controllers() {
            if !ctrls.contains(&ctrl) {
                ctrls.push(ctrl);
            }
        }

        for anc in ancestors(&spec.cgroup_name).iter() {
            for ctrl in ctrls.iter() {
                match self.backend.enable_controller(anc, ctrl) {
                    Ok(true) => debug!("cgroup: enabled {:?} under {:?}", ctrl, anc),
                    Ok(false) => {}
                    Err(e) => debug!(
                        "cgroup: failed to enable {:?} under {:?} ({:#})",
                        ctrl, anc, &e
                    ),
                }
            }
        }
    }

    /// Create `client`'s group from scratch and apply its knobs. Errors only
    /// if the group itself can't be created.
    pub fn setup(&mut self, client: &str) -> Result<KnobReport> {
        let spec = self.spec(client)?.clone();

        if let Err(e) = self.clear(&spec) {
            warn!(
                "cgroup: failed to remove stale {:?} ({:#})",
                &spec.cgroup_name, &e
            );
        }

        for anc in ancestors(&spec.cgroup_name).into_iter().skip(1) {
            if !self.backend.exists(&anc) {
                self.created_parents.insert(anc);
            }
        }
        self.backend.create(&spec.cgroup_name)?;
        self.enable_controllers(&spec);

        let mut report = KnobReport::default();
        for (knob, value) in spec.knobs.iter() {
            match self.backend.write_knob(&spec.cgroup_name, knob, value) {
                Ok(()) => {
                    debug!("cgroup: {}/{} = {:?}", &spec.cgroup_name, knob, value);
                    report.applied.push(knob.clone());
                }
                Err(e) => report.failed.push(KnobFailure {
                    knob: knob.clone(),
                    reason: format!("{:#}", &e),
                }),
            }
        }
        Ok(report)
    }

    /// Set up every group. Returns the per-client knob reports, a client
    /// whose group couldn't be created is missing from the result.
    pub fn setup_all(&mut self) -> BTreeMap<String, KnobReport> {
        let clients: Vec<String> = self.groups.keys().cloned().collect();
        let mut reports = BTreeMap::new();

        for client in clients.iter() {
            match self.setup(client) {
                Ok(report) => {
                    let cgroup_name = &self.groups[client].cgroup_name;
                    if report.is_complete() {
                        info!(
                            "cgroup: [{}] {:?} ready, {} knobs applied",
                            client,
                            cgroup_name,
                            report.applied.len()
                        );
                    } else {
                        warn!(
                            "cgroup: [{}] {:?} {} knobs applied, {} failed",
                            client,
                            cgroup_name,
                            report.applied.len(),
                            report.failed.len()
                        );
                        for failure in report.failed.iter() {
                            warn!("cgroup: [{}] {}: {}", client, &failure.knob, &failure.reason);
                        }
                    }
                    reports.insert(client.clone(), report);
                }
                Err(e) => warn!(
                    "cgroup: [{}] setup failed, running without isolation ({:#})",
                    client, &e
                ),
            }
        }
        reports
    }

    pub fn attach(&self, client: &str, pid: u32) -> AttachOutcome {
        let spec = match self.groups.get(client) {
            Some(v) => v,
            None => return AttachOutcome::NoGroup,
        };
        match self.backend.attach(&spec.cgroup_name, pid) {
            Ok(()) => {
                debug!("cgroup: attached {} to {:?}", pid, &spec.cgroup_name);
                AttachOutcome::Attached
            }
            Err(e) => {
                warn!(
                    "cgroup: failed to attach {} to {:?} ({:#})",
                    pid, &spec.cgroup_name, &e
                );
                AttachOutcome::Failed(format!("{:#}", &e))
            }
        }
    }

    pub fn teardown_all(&mut self) {
        for spec in self.groups.values() {
            if let Err(e) = self.clear(spec) {
                warn!("cgroup: failed to remove {:?} ({:#})", &spec.cgroup_name, &e);
            }
        }

        // Deepest first, a parent still holding other groups stays.
        let mut parents: Vec<String> = self.created_parents.iter().cloned().collect();
        parents.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for parent in parents.iter() {
            match self.backend.remove_empty(parent) {
                Ok(()) => {
                    self.created_parents.remove(parent);
                }
                Err(e) => debug!("cgroup: leaving {:?} ({:#})", parent, &e),
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use fairbench_intf::parse_resource_groups;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    pub struct MemGroup {
        pub knobs: BTreeMap<String, String>,
        pub members: Vec<u32>,
        pub subtree: BTreeSet<String>,
    }

    /// In-memory stand-in for the cgroup tree. Knobs listed in
    /// `unsupported` behave like missing control files.
    #[derive(Clone, Default)]
    pub struct MemBackend {
        pub groups: Arc<Mutex<BTreeMap<String, MemGroup>>>,
        pub unsupported: Vec<String>,
    }

    impl MemBackend {
        fn is_within(group: &str, top: &str) -> bool {
            group == top || group.starts_with(&format!("{}/", top))
        }
    }

    impl IsolationBackend for MemBackend {
        fn exists(&self, group: &str) -> bool {
            group.is_empty() || self.groups.lock().unwrap().contains_key(group)
        }

        fn create(&self, group: &str) -> Result<()> {
            let mut groups = self.groups.lock().unwrap();
            for anc in ancestors(group).into_iter().skip(1) {
                groups.entry(anc).or_default();
            }
            groups.entry(group.to_string()).or_default();
            Ok(())
        }

        fn enable_controller(&self, group: &str, ctrl: &str) -> Result<bool> {
            let mut groups = self.groups.lock().unwrap();
            let grp = groups.entry(group.to_string()).or_default();
            Ok(grp.subtree.insert(ctrl.to_string()))
        }

        fn write_knob(&self, group: &str, knob: &str, value: &str) -> Result<()> {
            if self.unsupported.iter().any(|k| k == knob) {
                bail!("{:?} is not available", knob);
            }
            let mut groups = self.groups.lock().unwrap();
            match groups.get_mut(group) {
                Some(grp) => {
                    grp.knobs.insert(knob.to_string(), value.to_string());
                    Ok(())
                }
                None => bail!("{:?} doesn't exist", group),
            }
        }

        fn attach(&self, group: &str, pid: u32) -> Result<()> {
            let mut groups = self.groups.lock().unwrap();
            match groups.get_mut(group) {
                Some(grp) => {
                    grp.members.push(pid);
                    Ok(())
                }
                None => bail!("{:?} doesn't exist", group),
            }
        }

        fn kill_members(&self, group: &str) -> Result<usize> {
            let mut groups = self.groups.lock().unwrap();
            let mut nr = 0;
            for (name, grp) in groups.iter_mut() {
                if Self::is_within(name, group) {
                    nr += grp.members.len();
                    grp.members.clear();
                }
            }
            Ok(nr)
        }

        fn remove(&self, group: &str) -> Result<()> {
            let mut groups = self.groups.lock().unwrap();
            if groups
                .iter()
                .any(|(name, grp)| Self::is_within(name, group) && !grp.members.is_empty())
            {
                bail!("{:?} is busy", group);
            }
            groups.retain(|name, _| !Self::is_within(name, group));
            Ok(())
        }

        fn remove_empty(&self, group: &str) -> Result<()> {
            let mut groups = self.groups.lock().unwrap();
            if groups
                .keys()
                .any(|name| name != group && Self::is_within(name, group))
            {
                bail!("{:?} has child groups", group);
            }
            groups.remove(group);
            Ok(())
        }
    }

    const GROUPS: &str = "\
[client1_steady]
cgroup_name = fairness/steady
io.weight = default 500
memory.high = 4G
[client2_bursty]
cgroup_name = fairness/bursty
io.weight = default 100
io.max = 8:0 riops=100
";

    fn controller(backend: &MemBackend) -> ResourceGroupController {
        ResourceGroupController::new(
            Box::new(backend.clone()),
            parse_resource_groups(GROUPS).unwrap(),
        )
    }

    fn knob_snapshot(backend: &MemBackend) -> BTreeMap<String, BTreeMap<String, String>> {
        backend
            .groups
            .lock()
            .unwrap()
            .iter()
            .map(|(name, grp)| (name.clone(), grp.knobs.clone()))
            .collect()
    }

    #[test]
    fn test_setup_is_idempotent() {
        let _ = ::env_logger::try_init();
        let backend = MemBackend::default();
        let mut ctl = controller(&backend);

        let reports = ctl.setup_all();
        assert_eq!(reports.len(), 2);
        assert!(reports.values().all(|r| r.is_complete()));
        let once = knob_snapshot(&backend);

        // Stale members get killed and the group is recreated.
        assert_eq!(ctl.attach("client1_steady", 4242), AttachOutcome::Attached);
        ctl.setup_all();
        assert_eq!(knob_snapshot(&backend), once);
        assert!(backend.groups.lock().unwrap()["fairness/steady"]
            .members
            .is_empty());

        assert_eq!(once["fairness/steady"]["io.weight"], "default 500");
        let groups = backend.groups.lock().unwrap();
        for anc in &["", "fairness"] {
            let subtree = &groups[*anc].subtree;
            for ctrl in &["cpu", "memory", "io"] {
                assert!(subtree.contains(*ctrl), "{} not enabled under {:?}", ctrl, anc);
            }
        }
    }

    #[test]
    fn test_missing_knob_is_counted() {
        let _ = ::env_logger::try_init();
        let backend = MemBackend {
            unsupported: vec!["io.max".into()],
            ..Default::default()
        };
        let mut ctl = controller(&backend);

        let report = ctl.setup("client2_bursty").unwrap();
        assert_eq!(report.applied, vec!["io.weight".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].knob, "io.max");
        assert!(!report.is_complete());
    }

    #[test]
    fn test_attach_and_teardown() {
        let _ = ::env_logger::try_init();
        let backend = MemBackend::default();
        let mut ctl = controller(&backend);
        ctl.setup_all();

        assert_eq!(ctl.attach("nobody", 1), AttachOutcome::NoGroup);
        assert_eq!(ctl.attach("client2_bursty", 77), AttachOutcome::Attached);
        assert!(ctl.setup("nobody").is_err());

        ctl.teardown_all();
        let groups = backend.groups.lock().unwrap();
        assert!(!groups.contains_key("fairness/steady"));
        assert!(!groups.contains_key("fairness/bursty"));
        assert!(!groups.contains_key("fairness"));
    }

    #[test]
    fn test_teardown_keeps_shared_parent() {
        let _ = ::env_logger::try_init();
        let backend = MemBackend::default();
        let mut ctl = controller(&backend);
        ctl.setup_all();
        backend.create("fairness/other").unwrap();

        ctl.teardown_all();
        let groups = backend.groups.lock().unwrap();
        assert!(!groups.contains_key("fairness/steady"));
        assert!(groups.contains_key("fairness"));
        assert!(groups.contains_key("fairness/other"));
    }

    #[test]
    fn test_cgroup_v2_files() {
        let _ = ::env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        let cg = CgroupV2::new(dir.path());
        assert!(!cg.is_available());

        cg.create("a/b").unwrap();
        assert!(cg.exists("a/b"));

        fs::write(dir.path().join("cgroup.subtree_control"), "memory\n").unwrap();
        assert!(!cg.enable_controller("", "memory").unwrap());
        assert!(cg.enable_controller("", "io").unwrap());

        assert!(cg.write_knob("a/b", "io.weight", "100").is_err());
        fs::write(dir.path().join("a/b/io.weight"), "").unwrap();
        cg.write_knob("a/b", "io.weight", "100").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a/b/io.weight")).unwrap(), "100");

        fs::write(dir.path().join("a/b/cgroup.procs"), "").unwrap();
        cg.attach("a/b", 1234).unwrap();
        assert_eq!(read_pid_list(dir.path().join("a/b/cgroup.procs")).unwrap(), vec![1234]);

        assert!(cg.remove("").is_err());
        assert!(cg.remove_empty("a").is_err());
        // Control files vanish with the group on a real hierarchy.
        fs::remove_dir_all(dir.path().join("a/b")).unwrap();
        cg.remove_empty("a").unwrap();
        assert!(!cg.exists("a"));
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("a"), vec!["".to_string()]);
        assert_eq!(
            ancestors("a/b/c"),
            vec!["".to_string(), "a".to_string(), "a/b".to_string()]
        );
    }
}
