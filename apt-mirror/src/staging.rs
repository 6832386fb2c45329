// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! On-disk layout, staging, and atomic promotion.

Metadata is staged under `skel/` and renamed into `mirror/` only once a
repository's run has fully succeeded. In-flight downloads always write to
a `.partial` sibling so a final filename is never visible half-written.
Promotions are single renames and therefore require `skel/` and `mirror/`
to live on the same filesystem.
*/

use {
    crate::{config::Config, error::Result},
    std::path::{Path, PathBuf},
};

/// The three working directories of a mirror base.
#[derive(Clone, Debug)]
pub struct Layout {
    pub mirror_root: PathBuf,
    pub skel_root: PathBuf,
    pub var_root: PathBuf,
}

impl Layout {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mirror_root: config.mirror_path.clone(),
            skel_root: config.skel_path.clone(),
            var_root: config.var_path.clone(),
        }
    }

    /// Create the working directories if absent.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [&self.mirror_root, &self.skel_root, &self.var_root] {
            std::fs::create_dir_all(dir)?;
        }

        Ok(())
    }

    /// Join a repository prefix and an artifact path into one local
    /// mirror-relative path.
    pub fn local_rel(prefix: &str, artifact_rel: &str) -> String {
        format!(
            "{}/{}",
            prefix.trim_matches('/'),
            artifact_rel.trim_start_matches('/')
        )
    }

    pub fn mirror_file(&self, local_rel: &str) -> PathBuf {
        self.mirror_root.join(local_rel)
    }

    pub fn skel_file(&self, local_rel: &str) -> PathBuf {
        self.skel_root.join(local_rel)
    }

    /// The in-flight sibling of a destination path.
    pub fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }

    /// Rename one staged metadata file over its live counterpart.
    pub fn promote_file(&self, local_rel: &str, unlink: bool) -> Result<()> {
        let src = self.skel_file(local_rel);
        let dst = self.mirror_file(local_rel);

        rename_into_place(&src, &dst, unlink)
    }

    /// Promote a repository's staged metadata into the live tree.
    ///
    /// `index_rels` go first; `release_rels` are renamed afterwards so a
    /// client never observes a `Release` referencing an absent index.
    pub fn promote_metadata(
        &self,
        index_rels: &[String],
        release_rels: &[String],
        unlink: bool,
    ) -> Result<()> {
        for rel in index_rels {
            self.promote_file(rel, unlink)?;
        }

        for rel in release_rels {
            self.promote_file(rel, unlink)?;
        }

        Ok(())
    }
}

/// Move a completed file over its destination with a single rename.
///
/// With `unlink` set, an existing destination is removed first so a
/// hardlinked inode shared with other paths is not rewritten in place.
pub fn rename_into_place(src: &Path, dst: &Path, unlink: bool) -> Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if unlink && dst.exists() {
        std::fs::remove_file(dst)?;
    }

    std::fs::rename(src, dst)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn layout() -> (tempfile::TempDir, Layout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout {
            mirror_root: dir.path().join("mirror"),
            skel_root: dir.path().join("skel"),
            var_root: dir.path().join("var"),
        };
        layout.ensure_directories().unwrap();

        (dir, layout)
    }

    #[test]
    fn local_rel_joins_cleanly() {
        assert_eq!(
            Layout::local_rel("h/ubuntu", "dists/noble/InRelease"),
            "h/ubuntu/dists/noble/InRelease"
        );
        assert_eq!(
            Layout::local_rel("h/ubuntu/", "/pool/main/p/pkg.deb"),
            "h/ubuntu/pool/main/p/pkg.deb"
        );
    }

    #[test]
    fn partial_path_suffix() {
        assert_eq!(
            Layout::partial_path(Path::new("/x/Packages.xz")),
            PathBuf::from("/x/Packages.xz.partial")
        );
    }

    #[test]
    fn promotion_order_and_overwrite() -> Result<()> {
        let (_dir, layout) = layout();

        let index_rel = "h/d/dists/s/main/binary-amd64/Packages.gz".to_string();
        let release_rel = "h/d/dists/s/Release".to_string();

        for (rel, content) in [(&index_rel, "new index"), (&release_rel, "new release")] {
            let src = layout.skel_file(rel);
            std::fs::create_dir_all(src.parent().unwrap())?;
            std::fs::write(&src, content)?;
        }

        // Pre-existing live copy gets replaced.
        let live = layout.mirror_file(&release_rel);
        std::fs::create_dir_all(live.parent().unwrap())?;
        std::fs::write(&live, "old release")?;

        layout.promote_metadata(
            std::slice::from_ref(&index_rel),
            std::slice::from_ref(&release_rel),
            false,
        )?;

        assert_eq!(
            std::fs::read_to_string(layout.mirror_file(&index_rel))?,
            "new index"
        );
        assert_eq!(std::fs::read_to_string(live)?, "new release");
        assert!(!layout.skel_file(&release_rel).exists());

        Ok(())
    }

    #[test]
    fn unlink_breaks_hardlinks() -> Result<()> {
        let (dir, layout) = layout();

        let rel = "h/d/pool/a.deb";
        let dst = layout.mirror_file(rel);
        std::fs::create_dir_all(dst.parent().unwrap())?;
        std::fs::write(&dst, "old")?;

        // A second name sharing the inode.
        let twin = dir.path().join("twin.deb");
        std::fs::hard_link(&dst, &twin)?;

        let src = dir.path().join("incoming");
        std::fs::write(&src, "new")?;
        rename_into_place(&src, &dst, true)?;

        assert_eq!(std::fs::read_to_string(&dst)?, "new");
        assert_eq!(std::fs::read_to_string(&twin)?, "old");

        Ok(())
    }
}
