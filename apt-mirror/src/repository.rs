// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Repository model and metadata path planning. */

use {
    crate::{
        error::Result,
        io::Compression,
        release::{classify_index_path, IndexFileKind, ReleaseIndexEntry},
    },
    std::{collections::BTreeMap, path::PathBuf},
    url::Url,
};

/// One mirrored repository, derived from `deb`/`deb-src` lines.
///
/// Lines sharing scheme, host, path, and suite are merged into a single
/// repository carrying the union of their components and architectures.
/// Instances are immutable for the duration of a run.
#[derive(Clone, Debug)]
pub struct Repository {
    root_url: Url,
    pub suite: String,
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    /// Whether binary packages are mirrored (`deb` line seen).
    pub mirror_binary: bool,
    /// Whether source packages are mirrored (`deb-src` line seen).
    pub mirror_source: bool,
    /// Keyring from a `signed-by=` option, overriding the global one.
    pub keyring: Option<PathBuf>,
}

impl Repository {
    pub fn new(
        url: &str,
        suite: &str,
        components: Vec<String>,
        architectures: Vec<String>,
        mirror_source: bool,
        keyring: Option<PathBuf>,
    ) -> Result<Self> {
        let mut root_url = Url::parse(url)?;

        // Trailing slashes are significant when joining relative paths.
        if !root_url.path().ends_with('/') {
            root_url.set_path(&format!("{}/", root_url.path()));
        }

        Ok(Self {
            root_url,
            suite: suite.to_string(),
            components,
            architectures,
            mirror_binary: !mirror_source,
            mirror_source,
            keyring,
        })
    }

    /// The repository base URL, guaranteed to end with `/`.
    pub fn root_url(&self) -> &Url {
        &self.root_url
    }

    /// Human-readable identifier used in logs and errors.
    pub fn label(&self) -> String {
        format!("{} {}", self.root_url.as_str().trim_end_matches('/'), self.suite)
    }

    /// Key identifying repositories that must merge into one.
    pub fn merge_key(&self) -> (String, String) {
        (self.root_url.to_string(), self.suite.clone())
    }

    /// Fold another definition of the same repository into this one.
    pub fn absorb(&mut self, other: Repository) {
        for component in other.components {
            if !self.components.contains(&component) {
                self.components.push(component);
            }
        }

        for arch in other.architectures {
            if !self.architectures.contains(&arch) {
                self.architectures.push(arch);
            }
        }

        self.mirror_binary |= other.mirror_binary;
        self.mirror_source |= other.mirror_source;

        if self.keyring.is_none() {
            self.keyring = other.keyring;
        }
    }

    /// The directory prefix of this repository under `mirror/` and `skel/`.
    ///
    /// e.g. `http://archive.ubuntu.com/ubuntu` maps to
    /// `archive.ubuntu.com/ubuntu`.
    pub fn local_prefix(&self) -> String {
        Self::local_prefix_for_url(&self.root_url)
    }

    /// Translate a repository URL into its local directory prefix.
    ///
    /// The scheme is dropped; host, optional port, and path are kept.
    pub fn local_prefix_for_url(url: &Url) -> String {
        let mut prefix = url.host_str().unwrap_or_default().to_string();

        if let Some(port) = url.port() {
            prefix.push_str(&format!(":{}", port));
        }

        let path = url.path().trim_matches('/');
        if !path.is_empty() {
            prefix.push('/');
            prefix.push_str(path);
        }

        prefix
    }

    /// The `dists` directory of this repository's suite, repository-relative.
    pub fn dists_dir(&self) -> String {
        format!("dists/{}", self.suite.trim_matches('/'))
    }

    /// Candidate release file paths, in acquisition order.
    pub fn release_candidates(&self) -> [String; 3] {
        let dists = self.dists_dir();

        [
            format!("{}/InRelease", dists),
            format!("{}/Release", dists),
            format!("{}/Release.gpg", dists),
        ]
    }

    /// Obtain the index selector for this repository's configuration.
    pub fn index_selector(&self) -> IndexSelector {
        let mut architectures = self.architectures.clone();
        if !architectures.iter().any(|a| a == "all") {
            architectures.push("all".to_string());
        }

        IndexSelector {
            components: self.components.clone(),
            architectures,
            binary: self.mirror_binary,
            source: self.mirror_source,
        }
    }
}

/// Filters `Release`-listed index paths down to the configured
/// components × architectures.
///
/// The selector never invents paths; it only admits entries the `Release`
/// file actually declares.
#[derive(Clone, Debug)]
pub struct IndexSelector {
    components: Vec<String>,
    /// Requested architectures plus the implicit `all`.
    architectures: Vec<String>,
    binary: bool,
    source: bool,
}

/// An index file that should be downloaded and parsed for archive references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseTarget {
    /// Path relative to the `dists/<suite>` directory.
    pub path: String,
    pub compression: Compression,
    pub kind: ParseKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseKind {
    BinaryPackages,
    Sources,
}

impl IndexSelector {
    fn has_component(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }

    fn has_architecture(&self, architecture: &str) -> bool {
        self.architectures.iter().any(|a| a == architecture)
    }

    /// Whether a `Release`-listed path should be mirrored.
    pub fn matches(&self, path: &str) -> bool {
        match classify_index_path(path) {
            Some(IndexFileKind::Packages {
                component,
                architecture,
                ..
            }) => self.binary && self.has_component(component) && self.has_architecture(architecture),

            Some(IndexFileKind::Sources { component, .. }) => {
                self.source && self.has_component(component)
            }

            Some(IndexFileKind::Contents {
                component,
                architecture,
                ..
            }) => {
                let component_ok = component.map_or(true, |c| self.has_component(c));
                component_ok && self.has_architecture(architecture)
            }

            Some(IndexFileKind::Translation { component, .. }) => self.has_component(component),

            None => false,
        }
    }

    /// Pick which of the mirrored index files to parse for archive references.
    ///
    /// When a logical index is listed in several compressions, the most
    /// preferred one is parsed. Installer (udeb) indices are mirrored but
    /// never parsed.
    pub fn parse_targets(&self, index: &BTreeMap<String, ReleaseIndexEntry>) -> Vec<ParseTarget> {
        let mut packages: BTreeMap<(String, String), Vec<(String, Compression)>> = BTreeMap::new();
        let mut sources: BTreeMap<String, Vec<(String, Compression)>> = BTreeMap::new();

        for path in index.keys() {
            if !self.matches(path) {
                continue;
            }

            match classify_index_path(path) {
                Some(IndexFileKind::Packages {
                    component,
                    architecture,
                    installer: false,
                    compression,
                }) => {
                    packages
                        .entry((component.to_string(), architecture.to_string()))
                        .or_default()
                        .push((path.clone(), compression));
                }
                Some(IndexFileKind::Sources {
                    component,
                    compression,
                }) => {
                    sources
                        .entry(component.to_string())
                        .or_default()
                        .push((path.clone(), compression));
                }
                _ => {}
            }
        }

        let mut targets = vec![];

        for candidates in packages.into_values() {
            if let Some((path, compression)) = pick_preferred(candidates) {
                targets.push(ParseTarget {
                    path,
                    compression,
                    kind: ParseKind::BinaryPackages,
                });
            }
        }

        for candidates in sources.into_values() {
            if let Some((path, compression)) = pick_preferred(candidates) {
                targets.push(ParseTarget {
                    path,
                    compression,
                    kind: ParseKind::Sources,
                });
            }
        }

        targets
    }
}

fn pick_preferred(candidates: Vec<(String, Compression)>) -> Option<(String, Compression)> {
    Compression::preferred_order()
        .find_map(|preferred| candidates.iter().find(|(_, c)| *c == preferred).cloned())
}
