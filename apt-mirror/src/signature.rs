// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Release signature verification.

Verification is delegated to an external `gpgv` binary so the engine
never links a PGP implementation. The [ReleaseVerifier] trait is the
seam; [GpgvVerifier] is the production implementation and
[AcceptAllVerifier] the stand-in when verification is disabled (and the
fake used by tests).
*/

use {
    crate::error::{MirrorError, Result},
    async_trait::async_trait,
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
    tokio::process::Command,
    tracing::debug,
};

/// Verifies repository release signatures.
#[async_trait]
pub trait ReleaseVerifier: Send + Sync {
    /// Verify a clear-signed `InRelease` document.
    async fn verify_clearsigned(
        &self,
        repo: &str,
        data: &[u8],
        keyring: Option<&Path>,
    ) -> Result<()>;

    /// Verify a `Release` document against its detached `Release.gpg`
    /// signature.
    async fn verify_detached(
        &self,
        repo: &str,
        data: &[u8],
        signature: &[u8],
        keyring: Option<&Path>,
    ) -> Result<()>;
}

/// Verifier shelling out to `gpgv`.
#[derive(Clone, Debug)]
pub struct GpgvVerifier {
    program: PathBuf,
}

impl Default for GpgvVerifier {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gpgv"),
        }
    }
}

impl GpgvVerifier {
    /// Use an alternative `gpgv` binary.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, repo: &str, keyring: Option<&Path>, files: &[&Path]) -> Result<()> {
        let mut command = Command::new(&self.program);

        if let Some(keyring) = keyring {
            command.arg("--keyring").arg(keyring);
        }

        for file in files {
            command.arg(file);
        }

        debug!("{}: invoking {:?}", repo, command.as_std());

        let output = command.output().await.map_err(|e| {
            MirrorError::SignatureVerification {
                repo: repo.to_string(),
                reason: format!("failed to spawn {}: {}", self.program.display(), e),
            }
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(MirrorError::SignatureVerification {
                repo: repo.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

fn temp_file(data: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(data)?;
    file.flush()?;

    Ok(file)
}

#[async_trait]
impl ReleaseVerifier for GpgvVerifier {
    async fn verify_clearsigned(
        &self,
        repo: &str,
        data: &[u8],
        keyring: Option<&Path>,
    ) -> Result<()> {
        let document = temp_file(data)?;

        self.run(repo, keyring, &[document.path()]).await
    }

    async fn verify_detached(
        &self,
        repo: &str,
        data: &[u8],
        signature: &[u8],
        keyring: Option<&Path>,
    ) -> Result<()> {
        let signature_file = temp_file(signature)?;
        let document = temp_file(data)?;

        self.run(repo, keyring, &[signature_file.path(), document.path()])
            .await
    }
}

/// Verifier that accepts everything.
///
/// Used when `verify_gpg` is off and as the test stand-in.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllVerifier;

#[async_trait]
impl ReleaseVerifier for AcceptAllVerifier {
    async fn verify_clearsigned(&self, _: &str, _: &[u8], _: Option<&Path>) -> Result<()> {
        Ok(())
    }

    async fn verify_detached(&self, _: &str, _: &[u8], _: &[u8], _: Option<&Path>) -> Result<()> {
        Ok(())
    }
}
