// Copyright (c) Facebook, Inc. and its affiliates.
use log::warn;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use super::ini::parse_sections;
use super::ConfigError;

/// Isolation settings for one logical client. Knob names map directly onto
/// control files under the group's directory, e.g. `io.weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroupSpec {
    pub client: String,
    /// Path relative to the isolation root.
    pub cgroup_name: String,
    pub knobs: BTreeMap<String, String>,
}

impl ResourceGroupSpec {
    /// Controller names the knobs need, e.g. `io` for `io.weight`.
    pub fn controllers(&self) -> Vec<String> {
        let mut ctrls: Vec<String> = self
            .knobs
            .keys()
            .filter_map(|k| k.split_once('.').map(|(ctrl, _)| ctrl.to_string()))
            .filter(|ctrl| ctrl != "cgroup")
            .collect();
        ctrls.dedup();
        ctrls
    }
}

pub type ResourceGroups = BTreeMap<String, ResourceGroupSpec>;

fn normalize_cgroup_name(line: usize, client: &str, value: &str) -> Result<String, ConfigError> {
    let name = value.trim_matches('/');
    if name.is_empty() || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(ConfigError::InvalidValue {
            line,
            section: client.to_string(),
            key: "cgroup_name".into(),
            value: value.to_string(),
            reason: "must be a relative path without empty, '.' or '..' components".into(),
        });
    }
    Ok(name.to_string())
}

pub fn parse_resource_groups(text: &str) -> Result<ResourceGroups, ConfigError> {
    let mut groups = ResourceGroups::new();

    for sect in parse_sections(text).into_iter() {
        let mut spec = ResourceGroupSpec {
            client: sect.name.clone(),
            cgroup_name: sect.name.clone(),
            knobs: BTreeMap::new(),
        };

        for ent in sect.entries.iter() {
            if ent.key == "cgroup_name" {
                spec.cgroup_name = normalize_cgroup_name(ent.line, &sect.name, &ent.value)?;
                continue;
            }
            if ent.key.contains('/') || ent.key.is_empty() {
                return Err(ConfigError::InvalidValue {
                    line: ent.line,
                    section: sect.name.clone(),
                    key: ent.key.clone(),
                    value: ent.value.clone(),
                    reason: "knob name must be a plain file name".into(),
                });
            }
            if spec
                .knobs
                .insert(ent.key.clone(), ent.value.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateKnob {
                    line: ent.line,
                    section: sect.name.clone(),
                    knob: ent.key.clone(),
                });
            }
        }

        if groups.insert(spec.client.clone(), spec).is_some() {
            warn!(
                "config: line {}: resource group [{}] redefined, using the latter",
                sect.line, &sect.name
            );
        }
    }

    Ok(groups)
}

/// Load resource group definitions. A missing file is not an error and
/// yields `None`, which disables isolation.
pub fn load_resource_groups<P: AsRef<Path>>(path: P) -> Result<Option<ResourceGroups>, ConfigError> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(parse_resource_groups(&text)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_groups() {
        let _ = ::env_logger::try_init();
        let text = "\
[client1_steady]
cgroup_name = /fairness/steady
io.weight = default 500  # heavier
memory.high = 4G
cpu.weight = 200

[client2_bursty]
io.weight = 100
";
        let groups = parse_resource_groups(text).unwrap();
        assert_eq!(groups.len(), 2);

        let steady = &groups["client1_steady"];
        assert_eq!(steady.cgroup_name, "fairness/steady");
        assert_eq!(steady.knobs["io.weight"], "default 500");
        assert_eq!(steady.knobs.len(), 3);
        assert_eq!(steady.controllers(), vec!["cpu", "io", "memory"]);

        let bursty = &groups["client2_bursty"];
        assert_eq!(bursty.cgroup_name, "client2_bursty");
        assert_eq!(bursty.controllers(), vec!["io"]);
    }

    #[test]
    fn test_bad_resource_groups() {
        assert!(matches!(
            parse_resource_groups("[a]\nio.weight=1\nio.weight=2\n"),
            Err(ConfigError::DuplicateKnob { line: 3, .. })
        ));
        assert!(matches!(
            parse_resource_groups("[a]\ncgroup_name=../escape\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_resource_groups("[a]\nsub/io.weight=1\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_file_disables_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cgroup_config.ini");
        assert_eq!(load_resource_groups(&path).unwrap(), None);

        fs::write(&path, "[a]\nio.weight=10\n").unwrap();
        let groups = load_resource_groups(&path).unwrap().unwrap();
        assert_eq!(groups["a"].knobs["io.weight"], "10");
    }
}
