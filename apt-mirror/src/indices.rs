// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! `Packages` and `Sources` index parsing.

Both formats are control files: one paragraph per package. A `Packages`
stanza points at a single pool file via `Filename`; a `Sources` stanza
lists several files (`.dsc`, tarballs, diffs) under a common `Directory`
through per-checksum file lists.
*/

use {
    crate::{
        artifact::Artifact,
        control::ControlParagraphReader,
        error::{MirrorError, Result},
        io::{ChecksumType, ContentDigest},
    },
    std::collections::BTreeMap,
};

/// Extract archive artifacts from decompressed `Packages` content.
pub fn parse_binary_packages(data: &str) -> Result<Vec<Artifact>> {
    let mut artifacts = vec![];

    for paragraph in ControlParagraphReader::new(data.as_bytes()) {
        let paragraph = paragraph?;

        let filename = paragraph
            .field_str("Filename")
            .ok_or(MirrorError::StanzaRequiredFieldMissing("Filename"))?;
        let size: u64 = paragraph
            .field_str("Size")
            .ok_or(MirrorError::StanzaRequiredFieldMissing("Size"))?
            .trim()
            .parse()?;

        let mut digests = vec![];
        for checksum in ChecksumType::preferred_order() {
            if let Some(hex_digest) = paragraph.field_str(checksum.field_name()) {
                digests.push(ContentDigest::from_hex_digest(checksum, hex_digest.trim())?);
            }
        }

        artifacts.push(Artifact::archive(
            filename.trim().trim_start_matches('/'),
            size,
            digests,
        ));
    }

    Ok(artifacts)
}

/// Extract archive artifacts from decompressed `Sources` content.
///
/// File lists from every checksum field are merged per basename so each
/// emitted artifact carries all declared digest flavors.
pub fn parse_source_packages(data: &str) -> Result<Vec<Artifact>> {
    const CHECKSUM_FIELDS: &[(ChecksumType, &str)] = &[
        (ChecksumType::Sha512, "Checksums-Sha512"),
        (ChecksumType::Sha256, "Checksums-Sha256"),
        (ChecksumType::Sha1, "Checksums-Sha1"),
        (ChecksumType::Md5, "Files"),
    ];

    let mut artifacts = vec![];

    for paragraph in ControlParagraphReader::new(data.as_bytes()) {
        let paragraph = paragraph?;

        let directory = paragraph
            .field_str("Directory")
            .ok_or(MirrorError::StanzaRequiredFieldMissing("Directory"))?
            .trim()
            .trim_matches('/')
            .to_string();

        let mut files: BTreeMap<String, (u64, Vec<ContentDigest>)> = BTreeMap::new();

        for (checksum, field_name) in CHECKSUM_FIELDS {
            let Some(lines) = paragraph.field_iter_lines(field_name) else {
                continue;
            };

            for line in lines {
                if line.is_empty() {
                    continue;
                }

                // Lines are of form: <digest> <size> <basename>
                let mut parts = line.split_ascii_whitespace();
                let (digest, size, name) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(digest), Some(size), Some(name)) if parts.next().is_none() => {
                        (digest, size, name)
                    }
                    _ => {
                        return Err(MirrorError::SourceChecksumLineMalformed(line.to_string()));
                    }
                };

                let size: u64 = size.parse()?;
                let digest = ContentDigest::from_hex_digest(*checksum, digest)?;

                match files.get_mut(name) {
                    Some((declared_size, digests)) => {
                        if *declared_size != size {
                            return Err(MirrorError::DeclaredSizeConflict {
                                path: format!("{}/{}", directory, name),
                                first: *declared_size,
                                second: size,
                            });
                        }

                        if !digests.iter().any(|d| d.checksum_type() == *checksum) {
                            digests.push(digest);
                        }
                    }
                    None => {
                        files.insert(name.to_string(), (size, vec![digest]));
                    }
                }
            }
        }

        for (name, (size, digests)) in files {
            artifacts.push(Artifact::archive(
                format!("{}/{}", directory, name),
                size,
                digests,
            ));
        }
    }

    Ok(artifacts)
}

#[cfg(test)]
mod test {
    use super::*;

    const PACKAGES: &str = "\
Package: pkg
Version: 1.0-1
Architecture: amd64
Filename: pool/main/p/pkg/pkg_1.0-1_amd64.deb
Size: 2048
MD5sum: d41d8cd98f00b204e9800998ecf8427e
SHA256: e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855

Package: other
Version: 2.0-1
Architecture: amd64
Filename: pool/main/o/other/other_2.0-1_amd64.deb
Size: 100
SHA256: 48cfe101cd84f16baf720b99e8f2ff89fd7e063553966d8536b472677acb82f0
";

    const SOURCES: &str = "\
Package: pkg
Version: 1.0-1
Directory: pool/main/p/pkg
Files:
 d41d8cd98f00b204e9800998ecf8427e 10 pkg_1.0-1.dsc
 d41d8cd98f00b204e9800998ecf8427e 20 pkg_1.0.orig.tar.gz
Checksums-Sha256:
 e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 10 pkg_1.0-1.dsc
 48cfe101cd84f16baf720b99e8f2ff89fd7e063553966d8536b472677acb82f0 20 pkg_1.0.orig.tar.gz
";

    #[test]
    fn binary_packages() -> Result<()> {
        let artifacts = parse_binary_packages(PACKAGES)?;

        assert_eq!(artifacts.len(), 2);

        let first = &artifacts[0];
        assert_eq!(first.relative_path, "pool/main/p/pkg/pkg_1.0-1_amd64.deb");
        assert_eq!(first.size, Some(2048));
        assert_eq!(first.digests.len(), 2);
        assert_eq!(
            first.strongest_digest().unwrap().checksum_type(),
            ChecksumType::Sha256
        );

        assert_eq!(artifacts[1].digests.len(), 1);

        Ok(())
    }

    #[test]
    fn binary_packages_missing_filename() {
        let res = parse_binary_packages("Package: broken\nSize: 1\n");
        assert!(matches!(
            res,
            Err(MirrorError::StanzaRequiredFieldMissing("Filename"))
        ));
    }

    #[test]
    fn source_packages_merge_checksums() -> Result<()> {
        let artifacts = parse_source_packages(SOURCES)?;

        assert_eq!(artifacts.len(), 2);

        let dsc = artifacts
            .iter()
            .find(|a| a.relative_path == "pool/main/p/pkg/pkg_1.0-1.dsc")
            .unwrap();
        assert_eq!(dsc.size, Some(10));
        assert_eq!(dsc.digests.len(), 2);
        assert_eq!(
            dsc.strongest_digest().unwrap().checksum_type(),
            ChecksumType::Sha256
        );

        Ok(())
    }

    #[test]
    fn source_packages_size_conflict() {
        let data = "\
Package: pkg
Directory: pool/main/p/pkg
Files:
 d41d8cd98f00b204e9800998ecf8427e 10 pkg.dsc
Checksums-Sha256:
 e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855 11 pkg.dsc
";
        assert!(matches!(
            parse_source_packages(data),
            Err(MirrorError::DeclaredSizeConflict { .. })
        ));
    }

    #[test]
    fn empty_index_is_empty() -> Result<()> {
        assert!(parse_binary_packages("")?.is_empty());
        assert!(parse_source_packages("\n")?.is_empty());

        Ok(())
    }
}
