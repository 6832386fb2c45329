// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Download descriptors. */

use crate::io::{strongest_digest, ContentDigest};

/// The pipeline stage an artifact belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    /// Top-level `[In]Release` files.
    Release,
    /// Index files listed by a `Release` file.
    Index,
    /// Package and source files referenced from indices.
    Archive,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Index => "index",
            Self::Archive => "archive",
        }
    }
}

/// Describes one file to be mirrored.
#[derive(Clone, Debug)]
pub struct Artifact {
    /// Path relative to the repository base, on both the remote and local tree.
    pub relative_path: String,

    /// Declared size in bytes. Unknown for top-level `Release` files.
    pub size: Option<u64>,

    /// Every digest declared for this file. Possibly empty for `Release` files.
    pub digests: Vec<ContentDigest>,

    /// The stage this artifact is fetched in.
    pub stage: Stage,
}

impl Artifact {
    /// A top-level release file: no declared size or digest.
    pub fn release(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            size: None,
            digests: vec![],
            stage: Stage::Release,
        }
    }

    /// An index file listed by a `Release` file.
    pub fn index(relative_path: impl Into<String>, size: u64, digests: Vec<ContentDigest>) -> Self {
        Self {
            relative_path: relative_path.into(),
            size: Some(size),
            digests,
            stage: Stage::Index,
        }
    }

    /// A package or source file referenced from an index.
    pub fn archive(
        relative_path: impl Into<String>,
        size: u64,
        digests: Vec<ContentDigest>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            size: Some(size),
            digests,
            stage: Stage::Archive,
        }
    }

    /// The strongest declared digest, used for verification decisions.
    pub fn strongest_digest(&self) -> Option<&ContentDigest> {
        strongest_digest(&self.digests)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::io::ChecksumType,
    };

    #[test]
    fn strongest_digest_selection() {
        let artifact = Artifact::archive(
            "pool/main/p/pkg_1_amd64.deb",
            2048,
            vec![
                ContentDigest::from_hex_digest(
                    ChecksumType::Md5,
                    "d41d8cd98f00b204e9800998ecf8427e",
                )
                .unwrap(),
                ContentDigest::from_hex_digest(
                    ChecksumType::Sha256,
                    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                )
                .unwrap(),
            ],
        );

        assert_eq!(
            artifact.strongest_digest().unwrap().checksum_type(),
            ChecksumType::Sha256
        );
    }

    #[test]
    fn release_artifact_has_no_expectations() {
        let artifact = Artifact::release("dists/noble/InRelease");
        assert!(artifact.size.is_none());
        assert!(artifact.digests.is_empty());
        assert!(artifact.strongest_digest().is_none());
        assert_eq!(artifact.stage.name(), "release");
    }
}
