// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Release` file primitives. */

use {
    crate::{
        control::{ControlParagraph, ControlParagraphReader},
        error::{MirrorError, Result},
        io::{ChecksumType, Compression, ContentDigest},
    },
    chrono::{DateTime, TimeZone, Utc},
    mailparse::dateparse,
    std::{collections::BTreeMap, io::BufRead, str::FromStr},
};

const CLEARSIGN_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";

/// An entry for a file in a parsed `Release` file.
///
/// Instances correspond to a line in a `MD5Sum`, `SHA1`, `SHA256`, or
/// `SHA512` field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReleaseEntry<'a> {
    /// The path to this file, relative to the directory holding the `Release` file.
    pub path: &'a str,

    /// The checksum flavor of the digest on this line.
    pub checksum: ChecksumType,

    /// The hex digest of this file.
    pub digest: &'a str,

    /// The size of the file in bytes.
    pub size: u64,
}

/// The consolidated view of one indexed file across all checksum blocks.
#[derive(Clone, Debug)]
pub struct ReleaseIndexEntry {
    /// The declared size of the file in bytes.
    pub size: u64,

    /// Every digest declared for this file, one per checksum flavor.
    pub digests: Vec<ContentDigest>,
}

/// Classification of an index file path listed by a `Release` file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexFileKind<'a> {
    /// A `Packages` index for binary packages.
    Packages {
        component: &'a str,
        architecture: &'a str,
        /// Whether this is a `debian-installer` (udeb) index.
        installer: bool,
        compression: Compression,
    },

    /// A `Sources` index for source packages.
    Sources {
        component: &'a str,
        compression: Compression,
    },

    /// A `Contents` index mapping paths to packages.
    Contents {
        /// Component prefix, absent for suite-level `Contents-<arch>` files.
        component: Option<&'a str>,
        architecture: &'a str,
        installer: bool,
        compression: Compression,
    },

    /// An i18n `Translation-<lang>` index.
    Translation {
        component: &'a str,
        compression: Compression,
    },
}

/// Attempt to classify a `Release`-listed path as a known index flavor.
///
/// Paths that are none of the known index kinds (e.g. `Index` checksums
/// for pdiffs) resolve to [None].
pub fn classify_index_path(path: &str) -> Option<IndexFileKind<'_>> {
    let (dir, filename) = match path.rsplit_once('/') {
        Some((dir, filename)) => (dir, filename),
        None => ("", path),
    };

    let (stem, compression) = Compression::split(filename);

    if stem == "Packages" {
        // <component>[/debian-installer]/binary-<arch>/Packages*
        let (prefix, arch_dir) = dir.rsplit_once('/')?;
        let architecture = arch_dir.strip_prefix("binary-")?;

        let (component, installer) = match prefix.strip_suffix("/debian-installer") {
            Some(component) => (component, true),
            None => (prefix, false),
        };

        if component.is_empty() {
            return None;
        }

        return Some(IndexFileKind::Packages {
            component,
            architecture,
            installer,
            compression,
        });
    }

    if stem == "Sources" {
        // <component>/source/Sources*
        let component = dir.strip_suffix("source").and_then(|p| {
            let p = p.strip_suffix('/')?;
            (!p.is_empty()).then_some(p)
        })?;

        return Some(IndexFileKind::Sources {
            component,
            compression,
        });
    }

    if let Some(suffix) = stem.strip_prefix("Contents-") {
        let (architecture, installer) = match suffix.strip_prefix("udeb-") {
            Some(arch) => (arch, true),
            None => (suffix, false),
        };

        if architecture.is_empty() {
            return None;
        }

        return Some(IndexFileKind::Contents {
            component: (!dir.is_empty()).then_some(dir),
            architecture,
            installer,
            compression,
        });
    }

    if stem.starts_with("Translation-") {
        // <component>/i18n/Translation-<lang>*
        let component = dir.strip_suffix("i18n").and_then(|p| {
            let p = p.strip_suffix('/')?;
            (!p.is_empty()).then_some(p)
        })?;

        return Some(IndexFileKind::Translation {
            component,
            compression,
        });
    }

    None
}

/// A Debian repository `Release` file.
///
/// Release files contain metadata and list the index files for a
/// *repository*. Instances are wrappers around a [ControlParagraph].
pub struct ReleaseFile {
    paragraph: ControlParagraph,
}

impl ReleaseFile {
    /// Construct an instance by reading data from a reader.
    ///
    /// The source must be a control file with exactly 1 paragraph and must
    /// not be PGP armored. Use [ReleaseFile::parse] for raw `InRelease`
    /// content.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let paragraphs = ControlParagraphReader::new(reader).collect::<Result<Vec<_>>>()?;

        if paragraphs.len() != 1 {
            return Err(MirrorError::ReleaseParagraphMismatch(paragraphs.len()));
        }

        let paragraph = paragraphs
            .into_iter()
            .next()
            .expect("validated paragraph count above");

        Ok(Self { paragraph })
    }

    /// Construct an instance from raw `[In]Release` content.
    ///
    /// Clear-signed `InRelease` content has its armor stripped first. The
    /// signature itself is NOT validated here; that is the job of the
    /// external verifier.
    pub fn parse(data: &str) -> Result<Self> {
        if data.trim_start().starts_with(CLEARSIGN_HEADER) {
            let body = strip_clearsign_armor(data).ok_or_else(|| {
                MirrorError::ControlParse("malformed clear-signed release file".to_string())
            })?;

            Self::from_reader(body.as_bytes())
        } else {
            Self::from_reader(data.as_bytes())
        }
    }

    /// Obtain the given field's string value.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.paragraph.field_str(name)
    }

    /// Suite of this repository. e.g. `stable`, `unstable`.
    pub fn suite(&self) -> Option<&str> {
        self.paragraph.field_str("Suite")
    }

    /// Codename of this repository.
    pub fn codename(&self) -> Option<&str> {
        self.paragraph.field_str("Codename")
    }

    /// Origin of the repository.
    pub fn origin(&self) -> Option<&str> {
        self.paragraph.field_str("Origin")
    }

    /// Names of components within this repository.
    pub fn components(&self) -> Option<impl Iterator<Item = &str>> {
        self.paragraph.field_iter_words("Components")
    }

    /// Machine architectures supported by this repository.
    pub fn architectures(&self) -> Option<impl Iterator<Item = &str>> {
        self.paragraph.field_iter_words("Architectures")
    }

    /// Time the release file was created.
    pub fn date(&self) -> Option<Result<DateTime<Utc>>> {
        self.paragraph.field_str("Date").map(parse_control_date)
    }

    /// Time the release file should be considered expired by the client.
    pub fn valid_until(&self) -> Option<Result<DateTime<Utc>>> {
        self.paragraph
            .field_str("Valid-Until")
            .map(parse_control_date)
    }

    /// Obtain indexed files for a given checksum flavor.
    ///
    /// The returned iterator emits [ReleaseEntry] instances lazily; parse
    /// failures surface as errors.
    pub fn iter_index_files(
        &self,
        checksum: ChecksumType,
    ) -> Option<impl Iterator<Item = Result<ReleaseEntry<'_>>>> {
        self.paragraph
            .field_iter_lines(checksum.field_name())
            .map(move |iter| {
                iter.filter(|v| !v.is_empty()).map(move |v| {
                    // Lines are of form: <digest> <size> <path>
                    let mut parts = v.split_ascii_whitespace();

                    let digest = parts.next().ok_or(MirrorError::ReleaseMissingDigest)?;
                    let size = parts.next().ok_or(MirrorError::ReleaseMissingSize)?;
                    let path = parts.next().ok_or(MirrorError::ReleaseMissingPath)?;

                    if parts.next().is_some() {
                        return Err(MirrorError::ReleasePathWithSpaces(v.to_string()));
                    }

                    Ok(ReleaseEntry {
                        path,
                        checksum,
                        digest,
                        size: u64::from_str(size)?,
                    })
                })
            })
    }

    /// Consolidate every checksum block into one entry per listed path.
    ///
    /// Each entry carries all declared digest flavors. A path whose size
    /// differs between checksum blocks is a fatal inconsistency.
    pub fn file_index(&self) -> Result<BTreeMap<String, ReleaseIndexEntry>> {
        let mut index: BTreeMap<String, ReleaseIndexEntry> = BTreeMap::new();

        for checksum in ChecksumType::preferred_order() {
            let Some(iter) = self.iter_index_files(checksum) else {
                continue;
            };

            for entry in iter {
                let entry = entry?;
                let digest = ContentDigest::from_hex_digest(checksum, entry.digest)?;

                match index.get_mut(entry.path) {
                    Some(existing) => {
                        if existing.size != entry.size {
                            return Err(MirrorError::DeclaredSizeConflict {
                                path: entry.path.to_string(),
                                first: existing.size,
                                second: entry.size,
                            });
                        }

                        if !existing
                            .digests
                            .iter()
                            .any(|d| d.checksum_type() == checksum)
                        {
                            existing.digests.push(digest);
                        }
                    }
                    None => {
                        index.insert(
                            entry.path.to_string(),
                            ReleaseIndexEntry {
                                size: entry.size,
                                digests: vec![digest],
                            },
                        );
                    }
                }
            }
        }

        Ok(index)
    }
}

impl From<ControlParagraph> for ReleaseFile {
    fn from(paragraph: ControlParagraph) -> Self {
        Self { paragraph }
    }
}

fn parse_control_date(v: &str) -> Result<DateTime<Utc>> {
    let ts = dateparse(v)?;

    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| MirrorError::ControlParse(format!("unrepresentable date: {}", v)))
}

/// Extract the signed text from a PGP clear-signed document.
///
/// Skips the armor headers, undoes dash escaping, and stops at the
/// signature block. Resolves to [None] if the framing is malformed.
fn strip_clearsign_armor(data: &str) -> Option<String> {
    let mut lines = data.lines();

    loop {
        let line = lines.next()?;
        if line.trim_end() == CLEARSIGN_HEADER {
            break;
        }
        if !line.trim().is_empty() {
            return None;
        }
    }

    // Armor headers (`Hash: ...`) run until the first empty line.
    loop {
        let line = lines.next()?;
        if line.trim().is_empty() {
            break;
        }
    }

    let mut out = String::new();
    let mut terminated = false;

    for line in lines {
        if line.trim_end() == SIGNATURE_HEADER {
            terminated = true;
            break;
        }

        out.push_str(line.strip_prefix("- ").unwrap_or(line));
        out.push('\n');
    }

    terminated.then_some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    const RELEASE: &str = "\
Origin: Ubuntu
Suite: noble
Codename: noble
Date: Thu, 25 Apr 2024 15:10:33 UTC
Architectures: amd64 arm64 all
Components: main universe
MD5Sum:
 9f4f35536800a1b6f9d2054e9fbd2b10 100 main/binary-amd64/Packages
 29b0e52857b463b2a9a1b6b79f6d77b8 64 main/binary-amd64/Packages.xz
SHA256:
 48cfe101cd84f16baf720b99e8f2ff89fd7e063553966d8536b472677acb82f0 100 main/binary-amd64/Packages
 706c840235798e098d4d6013d1dabbc967f894d0ffa02c92ac959dcea85ddf54 64 main/binary-amd64/Packages.xz
 e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 0 main/source/Sources.gz
";

    #[test]
    fn parse_fields() -> Result<()> {
        let release = ReleaseFile::parse(RELEASE)?;

        assert_eq!(release.origin(), Some("Ubuntu"));
        assert_eq!(release.suite(), Some("noble"));
        assert_eq!(release.codename(), Some("noble"));
        assert_eq!(
            release.components().unwrap().collect::<Vec<_>>(),
            vec!["main", "universe"]
        );
        assert_eq!(
            release.architectures().unwrap().collect::<Vec<_>>(),
            vec!["amd64", "arm64", "all"]
        );

        let date = release.date().unwrap()?;
        assert_eq!(date.timestamp(), 1_714_057_833);

        assert!(release.valid_until().is_none());

        Ok(())
    }

    #[test]
    fn iter_entries() -> Result<()> {
        let release = ReleaseFile::parse(RELEASE)?;

        let entries = release
            .iter_index_files(ChecksumType::Sha256)
            .unwrap()
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[1],
            ReleaseEntry {
                path: "main/binary-amd64/Packages.xz",
                checksum: ChecksumType::Sha256,
                digest: "706c840235798e098d4d6013d1dabbc967f894d0ffa02c92ac959dcea85ddf54",
                size: 64,
            }
        );

        assert!(release.iter_index_files(ChecksumType::Sha512).is_none());

        Ok(())
    }

    #[test]
    fn file_index_merges_blocks() -> Result<()> {
        let release = ReleaseFile::parse(RELEASE)?;
        let index = release.file_index()?;

        assert_eq!(index.len(), 3);

        let entry = &index["main/binary-amd64/Packages.xz"];
        assert_eq!(entry.size, 64);
        assert_eq!(entry.digests.len(), 2);
        assert_eq!(entry.digests[0].checksum_type(), ChecksumType::Sha256);
        assert_eq!(entry.digests[1].checksum_type(), ChecksumType::Md5);

        // Only listed under SHA256.
        let sources = &index["main/source/Sources.gz"];
        assert_eq!(sources.digests.len(), 1);

        Ok(())
    }

    #[test]
    fn file_index_size_conflict_is_fatal() {
        let data = "\
Suite: noble
MD5Sum:
 d41d8cd98f00b204e9800998ecf8427e 100 main/binary-amd64/Packages
SHA256:
 e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 99 main/binary-amd64/Packages
";
        let release = ReleaseFile::parse(data).unwrap();

        assert!(matches!(
            release.file_index(),
            Err(MirrorError::DeclaredSizeConflict { .. })
        ));
    }

    #[test]
    fn multiple_paragraphs_rejected() {
        let data = "Suite: noble\n\nSuite: jammy\n";
        assert!(matches!(
            ReleaseFile::parse(data),
            Err(MirrorError::ReleaseParagraphMismatch(2))
        ));
    }

    #[test]
    fn classify_paths() {
        assert_eq!(
            classify_index_path("main/binary-amd64/Packages.xz"),
            Some(IndexFileKind::Packages {
                component: "main",
                architecture: "amd64",
                installer: false,
                compression: Compression::Xz,
            })
        );

        assert_eq!(
            classify_index_path("main/debian-installer/binary-arm64/Packages.gz"),
            Some(IndexFileKind::Packages {
                component: "main",
                architecture: "arm64",
                installer: true,
                compression: Compression::Gzip,
            })
        );

        assert_eq!(
            classify_index_path("universe/source/Sources.bz2"),
            Some(IndexFileKind::Sources {
                component: "universe",
                compression: Compression::Bzip2,
            })
        );

        assert_eq!(
            classify_index_path("Contents-amd64.gz"),
            Some(IndexFileKind::Contents {
                component: None,
                architecture: "amd64",
                installer: false,
                compression: Compression::Gzip,
            })
        );

        assert_eq!(
            classify_index_path("main/Contents-udeb-amd64"),
            Some(IndexFileKind::Contents {
                component: Some("main"),
                architecture: "amd64",
                installer: true,
                compression: Compression::None,
            })
        );

        assert_eq!(
            classify_index_path("main/i18n/Translation-en.xz"),
            Some(IndexFileKind::Translation {
                component: "main",
                compression: Compression::Xz,
            })
        );

        assert_eq!(classify_index_path("main/binary-amd64/Release"), None);
        assert_eq!(classify_index_path("main/source/Sources.diff/Index"), None);
    }

    #[test]
    fn clearsigned_release() -> Result<()> {
        let data = format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n{}- escaped line ignored content\n-----BEGIN PGP SIGNATURE-----\nfakesig\n-----END PGP SIGNATURE-----\n",
            "Suite: noble\nSHA256:\n e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 0 main/binary-amd64/Packages\n"
        );

        // The dash-escaped trailer is not valid control data, so feed a
        // well-formed document instead: armor + paragraph only.
        let data = data.replace("- escaped line ignored content\n", "");

        let release = ReleaseFile::parse(&data)?;
        assert_eq!(release.suite(), Some("noble"));
        assert_eq!(release.file_index()?.len(), 1);

        Ok(())
    }

    #[test]
    fn clearsign_armor_dash_escape() {
        let data = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA512\n\nline one\n- -- dashes\n-----BEGIN PGP SIGNATURE-----\nsig\n-----END PGP SIGNATURE-----\n";
        let body = strip_clearsign_armor(data).unwrap();
        assert_eq!(body, "line one\n-- dashes\n");
    }

    #[test]
    fn clearsign_armor_missing_signature_is_malformed() {
        let data = "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\nSuite: noble\n";
        assert!(strip_clearsign_armor(data).is_none());
    }
}
