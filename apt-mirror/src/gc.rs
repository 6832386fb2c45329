// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reference-tracking garbage collection.

After a fully successful run, the set of live files under each cleanable
prefix is diffed against the wanted-set accumulated from repository
metadata. The difference is either written to `var/clean.sh` for operator
review or unlinked directly, per the `clean` mode.

Only prefixes named by a `clean <base-url>` directive participate.
`.partial` files are never collected: an interrupted download must stay
resumable.
*/

use {
    crate::error::Result,
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
    },
};

/// Files eligible for removal under one cleanable prefix.
#[derive(Clone, Debug, Default)]
pub struct CleanPlan {
    /// The prefix, relative to the mirror root.
    pub prefix: String,

    /// Mirror-relative paths of unreferenced regular files, sorted.
    pub delete: Vec<String>,

    /// Total size of the files in `delete`.
    pub bytes: u64,
}

impl CleanPlan {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty()
    }
}

/// Compute the removal plan for one prefix.
///
/// `keep` holds mirror-relative paths that must survive: the union of
/// every configured repository's wanted-set.
pub fn plan_prefix(mirror_root: &Path, prefix: &str, keep: &HashSet<String>) -> Result<CleanPlan> {
    let mut plan = CleanPlan {
        prefix: prefix.to_string(),
        ..Default::default()
    };

    let root = mirror_root.join(prefix);
    if !root.is_dir() {
        return Ok(plan);
    }

    let mut files = vec![];
    collect_files(&root, &mut files)?;

    for path in files {
        let rel = path
            .strip_prefix(mirror_root)
            .expect("walked path is under the mirror root")
            .to_string_lossy()
            .into_owned();

        if rel.ends_with(".partial") || keep.contains(&rel) {
            continue;
        }

        plan.bytes += std::fs::metadata(&path)?.len();
        plan.delete.push(rel);
    }

    plan.delete.sort();

    Ok(plan)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }

    Ok(())
}

/// Write the removal plans as a POSIX shell script.
pub fn write_script(script_path: &Path, mirror_root: &Path, plans: &[CleanPlan]) -> Result<()> {
    let total_files: usize = plans.iter().map(|p| p.delete.len()).sum();
    let total_bytes: u64 = plans.iter().map(|p| p.bytes).sum();

    let mut script = String::from("#!/bin/sh\nset -e\n\n");
    script.push_str(&format!(
        "# {} file(s), {} byte(s) unreferenced by current repository metadata\n",
        total_files, total_bytes
    ));

    for plan in plans {
        for rel in &plan.delete {
            script.push_str(&format!("rm -f '{}'\n", mirror_root.join(rel).display()));
        }
    }

    std::fs::write(script_path, script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(script_path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

/// Unlink every file in the plan. Returns the number of files removed.
pub fn execute_plan(mirror_root: &Path, plan: &CleanPlan) -> Result<usize> {
    let mut removed = 0;

    for rel in &plan.delete {
        std::fs::remove_file(mirror_root.join(rel))?;
        removed += 1;
    }

    Ok(removed)
}
