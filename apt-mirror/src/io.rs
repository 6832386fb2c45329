// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers: content digests and index compression. */

use {
    crate::error::Result,
    async_compression::futures::bufread::{BzDecoder, GzipDecoder, XzDecoder},
    digest::DynDigest,
    futures::{AsyncBufRead, AsyncRead, AsyncReadExt},
    std::{fmt::Formatter, io::Read, path::Path, pin::Pin},
};

/// Checksum type / digest mechanism used in repository metadata.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// SHA-256.
    Sha256,

    /// SHA-512.
    Sha512,
}

impl ChecksumType {
    /// Emit variants from strongest to weakest.
    pub fn preferred_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Sha512, Self::Sha256, Self::Sha1, Self::Md5].into_iter()
    }

    /// Name of the control field in `Release` files holding this variant type.
    ///
    /// Field lookup is case insensitive, so this also matches the `MD5sum`
    /// spelling used in `Packages` stanzas.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Obtain a new hasher for this checksum flavor.
    pub fn new_hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::<md5::Md5>::default(),
            Self::Sha1 => Box::<sha1::Sha1>::default(),
            Self::Sha256 => Box::<sha2::Sha256>::default(),
            Self::Sha512 => Box::<sha2::Sha512>::default(),
        }
    }
}

/// Represents a content digest.
#[derive(Clone, Eq, PartialEq)]
pub enum ContentDigest {
    /// An MD5 digest.
    Md5(Vec<u8>),
    /// A SHA-1 digest.
    Sha1(Vec<u8>),
    /// A SHA-256 digest.
    Sha256(Vec<u8>),
    /// A SHA-512 digest.
    Sha512(Vec<u8>),
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5(data) => write!(f, "Md5({})", hex::encode(data)),
            Self::Sha1(data) => write!(f, "Sha1({})", hex::encode(data)),
            Self::Sha256(data) => write!(f, "Sha256({})", hex::encode(data)),
            Self::Sha512(data) => write!(f, "Sha512({})", hex::encode(data)),
        }
    }
}

impl ContentDigest {
    /// Obtain an instance by parsing a hex string as a [ChecksumType].
    pub fn from_hex_digest(checksum: ChecksumType, digest: &str) -> Result<Self> {
        Ok(Self::from_bytes(checksum, hex::decode(digest)?))
    }

    /// Construct an instance from raw digest bytes.
    pub fn from_bytes(checksum: ChecksumType, digest: Vec<u8>) -> Self {
        match checksum {
            ChecksumType::Md5 => Self::Md5(digest),
            ChecksumType::Sha1 => Self::Sha1(digest),
            ChecksumType::Sha256 => Self::Sha256(digest),
            ChecksumType::Sha512 => Self::Sha512(digest),
        }
    }

    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        match self {
            Self::Md5(x) => x,
            Self::Sha1(x) => x,
            Self::Sha256(x) => x,
            Self::Sha512(x) => x,
        }
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Obtain the [ChecksumType] for this digest.
    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Self::Md5(_) => ChecksumType::Md5,
            Self::Sha1(_) => ChecksumType::Sha1,
            Self::Sha256(_) => ChecksumType::Sha256,
            Self::Sha512(_) => ChecksumType::Sha512,
        }
    }
}

/// Select the strongest digest from a declared set.
pub fn strongest_digest(digests: &[ContentDigest]) -> Option<&ContentDigest> {
    ChecksumType::preferred_order()
        .find_map(|checksum| digests.iter().find(|d| d.checksum_type() == checksum))
}

/// Details of a digest verification failure.
#[derive(Clone, Debug)]
pub struct DigestMismatch {
    pub checksum: ChecksumType,
    pub expected: String,
    pub got: String,
}

impl std::fmt::Display for DigestMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} expected {}, got {}",
            self.checksum.field_name(),
            self.expected,
            self.got
        )
    }
}

/// Computes the strongest declared digest for one artifact while it
/// streams.
///
/// Weaker flavors listed alongside it stay in metadata but are never
/// checked; validity is decided by the strongest hash alone.
pub struct ArtifactDigester {
    part: Option<(ChecksumType, Box<dyn DynDigest + Send>)>,
}

impl ArtifactDigester {
    /// Create a digester for the strongest flavor present in `expected`.
    pub fn for_digests(expected: &[ContentDigest]) -> Self {
        Self {
            part: strongest_digest(expected)
                .map(|d| (d.checksum_type(), d.checksum_type().new_hasher())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.part.is_none()
    }

    /// Write content into the tracked hasher.
    pub fn update(&mut self, data: &[u8]) {
        if let Some((_, hasher)) = &mut self.part {
            hasher.update(data);
        }
    }

    /// Finish digesting and assert the computed digest against the
    /// strongest declared value.
    pub fn verify(
        mut self,
        expected: &[ContentDigest],
    ) -> std::result::Result<(), DigestMismatch> {
        let Some((checksum, hasher)) = &mut self.part else {
            return Ok(());
        };

        let got = hasher.finalize_reset();

        if let Some(want) = strongest_digest(expected) {
            if want.checksum_type() == *checksum && want.digest_bytes() != got.as_ref() {
                return Err(DigestMismatch {
                    checksum: *checksum,
                    expected: want.digest_hex(),
                    got: hex::encode(got),
                });
            }
        }

        Ok(())
    }
}

/// Compute a single digest flavor over a file's content.
///
/// This reads synchronously and should be called from a blocking context.
pub fn hash_file(path: &Path, checksum: ChecksumType) -> std::io::Result<ContentDigest> {
    let mut f = std::fs::File::open(path)?;
    let mut hasher = checksum.new_hasher();
    let mut buf = [0u8; 65536];

    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(ContentDigest::from_bytes(
        checksum,
        hasher.finalize_reset().to_vec(),
    ))
}

/// Compression format used by repository index files.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Compression {
    /// No compression (no extension).
    None,

    /// XZ compression (.xz extension).
    Xz,

    /// Gzip compression (.gz extension).
    Gzip,

    /// Bzip2 compression (.bz2 extension).
    Bzip2,
}

impl Compression {
    /// Filename extension for files compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
        }
    }

    /// The retrieval preference order when multiple compressions are listed.
    pub fn preferred_order() -> impl Iterator<Item = Compression> {
        [Self::Xz, Self::Bzip2, Self::Gzip, Self::None].into_iter()
    }

    /// Split a filename into its stem and detected compression format.
    pub fn split(name: &str) -> (&str, Compression) {
        if let Some(stem) = name.strip_suffix(".xz") {
            (stem, Self::Xz)
        } else if let Some(stem) = name.strip_suffix(".bz2") {
            (stem, Self::Bzip2)
        } else if let Some(stem) = name.strip_suffix(".gz") {
            (stem, Self::Gzip)
        } else {
            (name, Self::None)
        }
    }
}

/// Wrap a reader with transparent decompression.
pub fn read_decompressed(
    stream: Pin<Box<dyn AsyncBufRead + Send>>,
    compression: Compression,
) -> Pin<Box<dyn AsyncRead + Send>> {
    match compression {
        Compression::None => Box::pin(stream),
        Compression::Gzip => Box::pin(GzipDecoder::new(stream)),
        Compression::Xz => Box::pin(XzDecoder::new(stream)),
        Compression::Bzip2 => Box::pin(BzDecoder::new(stream)),
    }
}

/// Decompress an in-memory buffer.
pub async fn decompress(data: Vec<u8>, compression: Compression) -> Result<Vec<u8>> {
    let cursor = futures::io::Cursor::new(data);
    let mut reader = read_decompressed(Box::pin(cursor), compression);

    let mut out = Vec::new();
    reader.read_to_end(&mut out).await?;

    Ok(out)
}
