// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Artifact downloading.

One [Fetcher] is shared by every download worker in a run. Each fetch
streams the response body through the strongest declared digest into a
`.partial` sibling of the destination, then renames into place after
size and digest assertions hold. Interrupted partials are resumed with
`Range` requests; top-level release files (which carry no declared
digest) are revalidated with `If-Modified-Since` instead.

Transient failures retry with exponential backoff and jitter. 404 and
401/403 are terminal immediately.
*/

use {
    crate::{
        artifact::{Artifact, Stage},
        config::Config,
        error::{FetchErrorKind, MirrorError, Result},
        io::hash_file,
        io::ArtifactDigester,
        ratelimit::RateLimiter,
        staging::{rename_into_place, Layout},
    },
    chrono::{DateTime, Utc},
    futures::StreamExt,
    rand::Rng,
    reqwest::{header, Client, StatusCode},
    std::{
        path::{Path, PathBuf},
        time::{Duration, SystemTime},
    },
    tokio::io::AsyncWriteExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
    url::Url,
};

/// The result of a successful fetch.
#[derive(Clone, Copy, Debug)]
pub struct FetchOutcome {
    /// Bytes transferred over the network for this artifact.
    pub bytes_fetched: u64,

    /// Whether the local tree changed. [false] means the existing copy
    /// was already current and no body was transferred.
    pub changed: bool,
}

#[derive(Debug)]
struct FetchFailure {
    kind: FetchErrorKind,
    terminal: bool,
    detail: String,
}

impl FetchFailure {
    fn retryable(kind: FetchErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            terminal: false,
            detail: detail.into(),
        }
    }

    fn terminal(kind: FetchErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            terminal: true,
            detail: detail.into(),
        }
    }

    fn disk(e: impl std::fmt::Display) -> Self {
        Self::terminal(FetchErrorKind::Disk, e.to_string())
    }
}

/// Shared download worker state.
pub struct Fetcher {
    client: Client,
    layout: Layout,
    limiter: RateLimiter,
    resume: bool,
    verify_checksums: bool,
    retry_attempts: u32,
    retry_delay: f64,
    unlink: bool,
    cancel: CancellationToken,
}

impl Fetcher {
    /// Build the HTTP client and worker state from the run configuration.
    pub fn new(config: &Config, layout: Layout, cancel: CancellationToken) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.idle_timeout);

        if config.use_proxy {
            for (proxy_url, scheme) in [
                (&config.http_proxy, "http"),
                (&config.https_proxy, "https"),
            ] {
                if let Some(proxy_url) = proxy_url {
                    let mut proxy = match scheme {
                        "http" => reqwest::Proxy::http(proxy_url.as_str())?,
                        _ => reqwest::Proxy::https(proxy_url.as_str())?,
                    };

                    if let (Some(user), Some(password)) =
                        (&config.proxy_user, &config.proxy_password)
                    {
                        proxy = proxy.basic_auth(user, password);
                    }

                    builder = builder.proxy(proxy);
                }
            }
        } else {
            builder = builder.no_proxy();
        }

        Ok(Self {
            client: builder.build()?,
            layout,
            limiter: RateLimiter::new(config.limit_rate),
            resume: config.resume_partial_downloads,
            verify_checksums: config.verify_checksums,
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
            unlink: config.unlink,
            cancel,
        })
    }

    /// Download one artifact into its staging location.
    ///
    /// Metadata lands under `skel/`; archives are written directly under
    /// `mirror/` (their final name equals the staging name and content is
    /// hash-validated before the rename). An artifact whose live copy
    /// already matches its declared content is skipped without issuing a
    /// request.
    pub async fn fetch(
        &self,
        repo_url: &Url,
        artifact: &Artifact,
        local_rel: &str,
    ) -> Result<FetchOutcome> {
        let final_path = match artifact.stage {
            Stage::Archive => self.layout.mirror_file(local_rel),
            _ => self.layout.skel_file(local_rel),
        };
        let mirror_path = self.layout.mirror_file(local_rel);

        if let Some(outcome) = self.check_existing(artifact, &final_path, &mirror_path).await? {
            debug!("{}: up to date, skipping", local_rel);
            return Ok(outcome);
        }

        let url = repo_url.join(&artifact.relative_path)?;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if self.cancel.is_cancelled() {
                return Err(self.download_error(
                    repo_url,
                    artifact,
                    attempt,
                    FetchFailure::terminal(FetchErrorKind::Cancelled, "run interrupted"),
                ));
            }

            match self.attempt(&url, artifact, &final_path, &mirror_path).await {
                Ok(outcome) => {
                    debug!(
                        "{}: fetched {} byte(s) (attempt {})",
                        local_rel, outcome.bytes_fetched, attempt
                    );
                    return Ok(outcome);
                }
                Err(failure) if failure.terminal || attempt >= self.retry_attempts => {
                    return Err(self.download_error(repo_url, artifact, attempt, failure));
                }
                Err(failure) => {
                    let delay = self.backoff_delay(attempt);

                    warn!(
                        "{}: {}: {} (attempt {}): {}; retrying in {:.1}s",
                        repo_url.as_str().trim_end_matches('/'),
                        artifact.relative_path,
                        failure.kind,
                        attempt,
                        failure.detail,
                        delay.as_secs_f64(),
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(self.download_error(
                                repo_url,
                                artifact,
                                attempt,
                                FetchFailure::terminal(
                                    FetchErrorKind::Cancelled,
                                    "run interrupted",
                                ),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn download_error(
        &self,
        repo_url: &Url,
        artifact: &Artifact,
        attempts: u32,
        failure: FetchFailure,
    ) -> MirrorError {
        MirrorError::Download {
            repo: repo_url.as_str().trim_end_matches('/').to_string(),
            path: artifact.relative_path.clone(),
            kind: failure.kind,
            attempts,
            detail: failure.detail,
        }
    }

    /// Delay before the next attempt: `retry_delay * 2^(n-1)`, ±20% jitter.
    fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let base = self.retry_delay * 2f64.powi(failed_attempt as i32 - 1);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);

        Duration::from_secs_f64((base * jitter).max(0.0))
    }

    /// Check whether the live copy already satisfies the declared content.
    ///
    /// On a match, metadata is additionally copied into `skel/` so
    /// end-of-run promotion treats fetched and skipped files uniformly.
    async fn check_existing(
        &self,
        artifact: &Artifact,
        final_path: &Path,
        mirror_path: &Path,
    ) -> Result<Option<FetchOutcome>> {
        let Some(size) = artifact.size else {
            return Ok(None);
        };

        match std::fs::metadata(mirror_path) {
            Ok(meta) if meta.is_file() && meta.len() == size => {}
            _ => return Ok(None),
        }

        let enforce_digest = artifact.stage != Stage::Archive || self.verify_checksums;

        if enforce_digest {
            let Some(expected) = artifact.strongest_digest().cloned() else {
                return Ok(None);
            };

            let path = mirror_path.to_path_buf();
            let checksum = expected.checksum_type();
            let computed = tokio::task::spawn_blocking(move || hash_file(&path, checksum))
                .await
                .map_err(|e| std::io::Error::other(e))??;

            if computed != expected {
                return Ok(None);
            }
        }

        if final_path != mirror_path {
            copy_file(mirror_path, final_path)?;
        }

        Ok(Some(FetchOutcome {
            bytes_fetched: 0,
            changed: false,
        }))
    }

    async fn attempt(
        &self,
        url: &Url,
        artifact: &Artifact,
        final_path: &Path,
        mirror_path: &Path,
    ) -> std::result::Result<FetchOutcome, FetchFailure> {
        let partial = Layout::partial_path(final_path);

        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent).map_err(FetchFailure::disk)?;
        }

        let mut resume_from = 0u64;

        if self.resume {
            if let Ok(meta) = std::fs::metadata(&partial) {
                match artifact.size {
                    Some(total) if meta.len() > 0 && meta.len() < total => {
                        resume_from = meta.len();
                    }
                    _ => {
                        let _ = std::fs::remove_file(&partial);
                    }
                }
            }
        } else {
            let _ = std::fs::remove_file(&partial);
        }

        let mut request = self.client.get(url.clone());

        if resume_from > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", resume_from));
        }

        // Without a declared digest the only revalidation signal is the
        // live copy's mtime (top-level Release family).
        let conditional = artifact.digests.is_empty() && mirror_path.is_file();

        if conditional {
            if let Ok(modified) = std::fs::metadata(mirror_path).and_then(|m| m.modified()) {
                request = request.header(header::IF_MODIFIED_SINCE, http_date(modified));
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchFailure::retryable(FetchErrorKind::Network, e.to_string()))?;

        let status = response.status();

        let append = match status {
            StatusCode::NOT_MODIFIED if conditional => {
                if final_path != mirror_path {
                    copy_file(mirror_path, final_path).map_err(FetchFailure::disk)?;
                }

                return Ok(FetchOutcome {
                    bytes_fetched: 0,
                    changed: false,
                });
            }

            StatusCode::NOT_FOUND => {
                return Err(FetchFailure::terminal(FetchErrorKind::NotFound, "HTTP 404"));
            }

            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchFailure::terminal(
                    FetchErrorKind::Unauthorized,
                    format!("HTTP {}", status.as_u16()),
                ));
            }

            StatusCode::PARTIAL_CONTENT if resume_from > 0 => true,

            StatusCode::RANGE_NOT_SATISFIABLE => {
                let _ = std::fs::remove_file(&partial);

                return Err(FetchFailure::retryable(
                    FetchErrorKind::Status(416),
                    "range rejected; restarting from zero",
                ));
            }

            s if s.is_success() => {
                // A 200 to a range request restarts from the beginning.
                resume_from = 0;
                false
            }

            s => {
                return Err(FetchFailure::retryable(
                    FetchErrorKind::Status(s.as_u16()),
                    format!("HTTP {}", s.as_u16()),
                ));
            }
        };

        // Only the strongest declared digest decides validity; weaker
        // flavors are carried in metadata but never checked.
        let verify_digests = match artifact.strongest_digest() {
            Some(digest) => vec![digest.clone()],
            None => vec![],
        };

        let mut digester = ArtifactDigester::for_digests(&verify_digests);

        if append && !digester.is_empty() {
            digester = hash_resumed_prefix(&partial, digester).await?;
        }

        let mut file = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await
        } else {
            tokio::fs::File::create(&partial).await
        }
        .map_err(FetchFailure::disk)?;

        let mut written = resume_from;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                // The partial stays behind for the next run to resume.
                return Err(FetchFailure::terminal(
                    FetchErrorKind::Cancelled,
                    "run interrupted",
                ));
            }

            let chunk =
                chunk.map_err(|e| FetchFailure::retryable(FetchErrorKind::Network, e.to_string()))?;

            self.limiter.acquire(chunk.len() as u64).await;

            digester.update(&chunk);
            file.write_all(&chunk).await.map_err(FetchFailure::disk)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(FetchFailure::disk)?;

        if let Some(expected) = artifact.size {
            if written != expected {
                // A short read stays resumable; an overrun is discarded.
                if written > expected || !self.resume {
                    drop(file);
                    let _ = std::fs::remove_file(&partial);
                }

                return Err(FetchFailure::retryable(
                    FetchErrorKind::SizeMismatch,
                    format!("expected {} byte(s), received {}", expected, written),
                ));
            }
        }

        let enforce_digest = artifact.stage != Stage::Archive || self.verify_checksums;

        if enforce_digest {
            if let Err(mismatch) = digester.verify(&verify_digests) {
                drop(file);
                let _ = std::fs::remove_file(&partial);

                return Err(FetchFailure::retryable(
                    FetchErrorKind::DigestMismatch,
                    mismatch.to_string(),
                ));
            }
        }

        file.sync_all().await.map_err(FetchFailure::disk)?;
        drop(file);

        rename_into_place(&partial, final_path, self.unlink).map_err(|e| FetchFailure::disk(e))?;

        Ok(FetchOutcome {
            bytes_fetched: written.saturating_sub(resume_from),
            changed: true,
        })
    }
}

/// Re-hash the bytes already present in a resumed partial file.
async fn hash_resumed_prefix(
    path: &Path,
    mut digester: ArtifactDigester,
) -> std::result::Result<ArtifactDigester, FetchFailure> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> std::io::Result<ArtifactDigester> {
        use std::io::Read;

        let mut f = std::fs::File::open(&path)?;
        let mut buf = [0u8; 65536];

        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            digester.update(&buf[..n]);
        }

        Ok(digester)
    })
    .await
    .map_err(FetchFailure::disk)?
    .map_err(FetchFailure::disk)
}

fn copy_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::copy(src, dst)?;

    Ok(())
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::io::{ChecksumType, ContentDigest},
        sha2::{Digest, Sha256},
        wiremock::{
            matchers::{header, method, path},
            Mock, MockServer, ResponseTemplate,
        },
    };

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(md5::Md5::digest(data))
    }

    fn test_config() -> Config {
        Config {
            retry_attempts: 3,
            retry_delay: 0.0,
            ..Config::default()
        }
    }

    fn test_fetcher(dir: &Path, config: &Config) -> Fetcher {
        let layout = Layout {
            mirror_root: dir.join("mirror"),
            skel_root: dir.join("skel"),
            var_root: dir.join("var"),
        };
        layout.ensure_directories().unwrap();

        Fetcher::new(config, layout, CancellationToken::new()).unwrap()
    }

    fn archive_artifact(rel: &str, body: &[u8]) -> Artifact {
        Artifact::archive(
            rel,
            body.len() as u64,
            vec![
                ContentDigest::from_hex_digest(ChecksumType::Sha256, &sha256_hex(body)).unwrap(),
            ],
        )
    }

    #[tokio::test]
    async fn fetch_archive_promotes_after_verification() -> Result<()> {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        let body = b"deb package bytes";
        Mock::given(method("GET"))
            .and(path("/ubuntu/pool/p/pkg_1_amd64.deb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri()))?;
        let artifact = archive_artifact("pool/p/pkg_1_amd64.deb", body);

        let outcome = fetcher
            .fetch(&repo_url, &artifact, "h/ubuntu/pool/p/pkg_1_amd64.deb")
            .await?;

        assert!(outcome.changed);
        assert_eq!(outcome.bytes_fetched, body.len() as u64);

        let final_path = dir.path().join("mirror/h/ubuntu/pool/p/pkg_1_amd64.deb");
        assert_eq!(std::fs::read(&final_path)?, body);
        assert!(!Layout::partial_path(&final_path).exists());

        Ok(())
    }

    #[tokio::test]
    async fn matching_local_file_skips_request() -> Result<()> {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        let body = b"already mirrored";
        let local = dir.path().join("mirror/h/ubuntu/pool/p/done.deb");
        std::fs::create_dir_all(local.parent().unwrap())?;
        std::fs::write(&local, body)?;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri()))?;
        let artifact = archive_artifact("pool/p/done.deb", body);

        let outcome = fetcher
            .fetch(&repo_url, &artifact, "h/ubuntu/pool/p/done.deb")
            .await?;

        assert!(!outcome.changed);
        assert_eq!(outcome.bytes_fetched, 0);

        Ok(())
    }

    #[tokio::test]
    async fn corrupted_local_file_is_refetched() -> Result<()> {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        let body = b"pristine content!";
        let local = dir.path().join("mirror/h/ubuntu/pool/p/c.deb");
        std::fs::create_dir_all(local.parent().unwrap())?;

        // Same length, one byte flipped.
        let mut corrupt = body.to_vec();
        corrupt[0] ^= 0xff;
        std::fs::write(&local, &corrupt)?;

        Mock::given(method("GET"))
            .and(path("/ubuntu/pool/p/c.deb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri()))?;
        let artifact = archive_artifact("pool/p/c.deb", body);

        let outcome = fetcher.fetch(&repo_url, &artifact, "h/ubuntu/pool/p/c.deb").await?;

        assert!(outcome.changed);
        assert_eq!(std::fs::read(&local)?, body);

        Ok(())
    }

    #[tokio::test]
    async fn tampered_weak_digest_is_ignored_when_strongest_matches() -> Result<()> {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        let body = b"dual digest artifact";
        Mock::given(method("GET"))
            .and(path("/ubuntu/pool/p/dual.deb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri()))?;
        let artifact = Artifact::archive(
            "pool/p/dual.deb",
            body.len() as u64,
            vec![
                // Deliberately wrong MD5; the SHA-256 is correct.
                ContentDigest::from_hex_digest(ChecksumType::Md5, &md5_hex(b"not the body"))
                    .unwrap(),
                ContentDigest::from_hex_digest(ChecksumType::Sha256, &sha256_hex(body)).unwrap(),
            ],
        );

        let outcome = fetcher
            .fetch(&repo_url, &artifact, "h/ubuntu/pool/p/dual.deb")
            .await?;

        assert!(outcome.changed);
        assert_eq!(
            std::fs::read(dir.path().join("mirror/h/ubuntu/pool/p/dual.deb"))?,
            body
        );

        Ok(())
    }

    #[tokio::test]
    async fn tampered_strongest_digest_fails_despite_matching_weak() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let fetcher = test_fetcher(dir.path(), &config);

        let body = b"dual digest artifact";
        Mock::given(method("GET"))
            .and(path("/ubuntu/pool/p/dual.deb"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .expect(config.retry_attempts as u64)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri())).unwrap();
        let artifact = Artifact::archive(
            "pool/p/dual.deb",
            body.len() as u64,
            vec![
                // Correct MD5 cannot rescue a tampered SHA-256.
                ContentDigest::from_hex_digest(ChecksumType::Md5, &md5_hex(body)).unwrap(),
                ContentDigest::from_hex_digest(ChecksumType::Sha256, &sha256_hex(b"not the body"))
                    .unwrap(),
            ],
        );

        let err = fetcher
            .fetch(&repo_url, &artifact, "h/ubuntu/pool/p/dual.deb")
            .await
            .unwrap_err();

        match err {
            MirrorError::Download { kind, attempts, .. } => {
                assert_eq!(kind, FetchErrorKind::DigestMismatch);
                assert_eq!(attempts, config.retry_attempts);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(!dir.path().join("mirror/h/ubuntu/pool/p/dual.deb").exists());
    }

    #[tokio::test]
    async fn not_found_is_terminal_without_retry() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri())).unwrap();
        let artifact = archive_artifact("pool/p/gone.deb", b"whatever");

        let err = fetcher
            .fetch(&repo_url, &artifact, "h/ubuntu/pool/p/gone.deb")
            .await
            .unwrap_err();

        match err {
            MirrorError::Download { kind, attempts, .. } => {
                assert_eq!(kind, FetchErrorKind::NotFound);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn digest_mismatch_exhausts_retries() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let fetcher = test_fetcher(dir.path(), &config);

        let body = b"expected content";
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered content".to_vec()))
            .expect(config.retry_attempts as u64)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri())).unwrap();
        let artifact = archive_artifact("pool/p/bad.deb", body);

        let err = fetcher
            .fetch(&repo_url, &artifact, "h/ubuntu/pool/p/bad.deb")
            .await
            .unwrap_err();

        match err {
            MirrorError::Download { kind, attempts, .. } => {
                assert_eq!(kind, FetchErrorKind::DigestMismatch);
                assert_eq!(attempts, config.retry_attempts);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Nothing was promoted.
        assert!(!dir.path().join("mirror/h/ubuntu/pool/p/bad.deb").exists());
    }

    #[tokio::test]
    async fn partial_file_resumes_with_range() -> Result<()> {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        let body = b"0123456789abcdef";
        let (head, tail) = body.split_at(6);

        // Seed a partial from an interrupted earlier transfer.
        let final_path = dir.path().join("mirror/h/ubuntu/pool/p/r.deb");
        let partial = Layout::partial_path(&final_path);
        std::fs::create_dir_all(partial.parent().unwrap())?;
        std::fs::write(&partial, head)?;

        Mock::given(method("GET"))
            .and(path("/ubuntu/pool/p/r.deb"))
            .and(header("Range", "bytes=6-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(tail.to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri()))?;
        let artifact = archive_artifact("pool/p/r.deb", body);

        let outcome = fetcher.fetch(&repo_url, &artifact, "h/ubuntu/pool/p/r.deb").await?;

        assert!(outcome.changed);
        assert_eq!(outcome.bytes_fetched, tail.len() as u64);
        assert_eq!(std::fs::read(&final_path)?, body);

        Ok(())
    }

    #[tokio::test]
    async fn unchanged_release_is_revalidated_not_refetched() -> Result<()> {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher(dir.path(), &test_config());

        let rel = "h/ubuntu/dists/noble/InRelease";
        let mirror_copy = dir.path().join("mirror").join(rel);
        std::fs::create_dir_all(mirror_copy.parent().unwrap())?;
        std::fs::write(&mirror_copy, "Suite: noble\n")?;

        Mock::given(method("GET"))
            .and(path("/ubuntu/dists/noble/InRelease"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let repo_url = Url::parse(&format!("{}/ubuntu/", server.uri()))?;
        let artifact = Artifact::release("dists/noble/InRelease");

        let outcome = fetcher.fetch(&repo_url, &artifact, rel).await?;

        assert!(!outcome.changed);
        // Staged for promotion from the live copy.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("skel").join(rel))?,
            "Suite: noble\n"
        );

        Ok(())
    }
}
