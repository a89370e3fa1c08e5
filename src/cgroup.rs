//! Declared cgroup table and mark-and-sweep reconciliation.
//!
//! `cgroup NAME ctrl.prop:value,...` directives populate the table; after a
//! (re)load the tree below the runtime cgroup root is reconciled: declared
//! groups are created and configured, undeclared ones removed. Controller
//! writes are best effort; failures are logged and never fatal.

use std::{fs, path::PathBuf};

use tracing::{debug, warn};

use crate::runtime;

/// One declared top-level cgroup.
#[derive(Debug, Clone)]
pub struct CgroupDef {
    pub name: String,
    /// `ctrl.prop` to value pairs written into the group directory.
    pub props: Vec<(String, String)>,
    keep: bool,
}

/// Table of declared cgroups, reconciled against the filesystem.
#[derive(Debug, Default)]
pub struct CgroupTable {
    groups: Vec<CgroupDef>,
}

impl CgroupTable {
    /// Registers or updates group `name` with a `ctrl.prop:value,...` list.
    /// Names containing path separators or `..` are rejected.
    pub fn add(&mut self, name: &str, config: &str) {
        if name.contains("..") || name.contains('/') || name.is_empty() {
            warn!("cgroup: illegal name '{name}', skipping");
            return;
        }

        let props: Vec<(String, String)> = config
            .split(',')
            .filter(|token| !token.is_empty())
            .filter_map(|token| match token.split_once(':') {
                Some((prop, value)) => Some((prop.to_string(), value.to_string())),
                None => {
                    warn!("cgroup {name}: bad property '{token}', skipping");
                    None
                }
            })
            .collect();

        if let Some(def) = self.groups.iter_mut().find(|def| def.name == name) {
            def.props = props;
            def.keep = true;
            return;
        }

        self.groups.push(CgroupDef {
            name: name.to_string(),
            props,
            keep: true,
        });
    }

    /// Looks up a declared group.
    pub fn find(&self, name: &str) -> Option<&CgroupDef> {
        self.groups.iter().find(|def| def.name == name)
    }

    /// Reload step 1: mark every group unseen.
    pub fn mark_all(&mut self) {
        for def in &mut self.groups {
            def.keep = false;
        }
    }

    /// Creates and configures every declared group under the cgroup root.
    pub fn config(&self) {
        let root = runtime::cgroup_root();
        for def in &self.groups {
            let dir = root.join(&def.name);
            if let Err(err) = fs::create_dir_all(&dir) {
                warn!("cgroup {}: create failed: {err}", def.name);
                continue;
            }
            for (prop, value) in &def.props {
                let path = dir.join(prop);
                if let Err(err) = fs::write(&path, value) {
                    warn!(
                        "cgroup {}: failed setting {prop}={value}: {err}",
                        def.name
                    );
                }
            }
        }
    }

    /// Drops unmarked groups from the table and removes their directories.
    pub fn cleanup(&mut self) {
        let root = runtime::cgroup_root();
        for def in self.groups.iter().filter(|def| !def.keep) {
            let dir = root.join(&def.name);
            debug!("removing unused cgroup {}", def.name);
            if let Err(err) = fs::remove_dir(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("cgroup {}: remove failed: {err}", def.name);
                }
            }
        }
        self.groups.retain(|def| def.keep);
    }

    /// Directory a service child should be attached to, if its group exists.
    pub fn dir_for(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        self.find(name)
            .map(|def| runtime::cgroup_root().join(&def.name))
    }
}
