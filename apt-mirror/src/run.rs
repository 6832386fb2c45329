// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Run orchestration.

A run moves through strictly ordered stages: acquire the lock, fetch and
verify every repository's `[In]Release`, fetch the indices those files
list, parse the indices into one global archive queue, fetch the
archives, promote staged metadata for fully successful repositories,
compute the cleanup plan, and finally spawn the postmirror hook.

Failures are scoped per repository: one broken upstream neither stops
the others nor triggers cleanup under its prefix.
*/

use {
    crate::{
        artifact::Artifact,
        config::{CleanMode, Config},
        error::{FetchErrorKind, MirrorError, Result},
        fetch::Fetcher,
        gc, indices,
        io::decompress,
        lock::LockFile,
        progress::{spawn_ticker, StageProgress},
        release::ReleaseFile,
        repository::{ParseKind, ParseTarget, Repository},
        signature::ReleaseVerifier,
        staging::Layout,
    },
    chrono::Utc,
    futures::StreamExt,
    std::{
        collections::{HashMap, HashSet},
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

const PROGRESS_PERIOD: Duration = Duration::from_secs(5);

/// Final state of one repository after a run.
#[derive(Debug)]
pub struct RepoReport {
    pub label: String,
    pub local_prefix: String,
    pub error: Option<MirrorError>,
}

impl RepoReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The outcome of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub repositories: Vec<RepoReport>,
    /// Path of the written cleanup script, when the clean mode produces one.
    pub clean_script: Option<PathBuf>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.repositories.iter().all(|r| r.succeeded())
    }

    pub fn has_signature_failure(&self) -> bool {
        self.repositories
            .iter()
            .any(|r| matches!(&r.error, Some(e) if e.is_signature_failure()))
    }
}

struct RepoState {
    repo: Repository,
    error: Option<MirrorError>,
    index_artifacts: Vec<Artifact>,
    parse_targets: Vec<ParseTarget>,
    /// Repository-relative paths of the release files actually fetched.
    release_fetched: Vec<String>,
    /// Mirror-relative paths this repository's metadata references.
    wanted: HashSet<String>,
}

impl RepoState {
    fn new(repo: Repository) -> Self {
        Self {
            repo,
            error: None,
            index_artifacts: vec![],
            parse_targets: vec![],
            release_fetched: vec![],
            wanted: HashSet::new(),
        }
    }

    fn fail(&mut self, error: MirrorError) {
        warn!("{}: {}", self.repo.label(), error);

        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// Everything the release stage learns about one repository.
struct RepoMetadata {
    index_artifacts: Vec<Artifact>,
    parse_targets: Vec<ParseTarget>,
    release_fetched: Vec<String>,
    wanted: HashSet<String>,
}

/// One full mirror synchronization.
pub struct MirrorRun {
    config: Arc<Config>,
    verifier: Arc<dyn ReleaseVerifier>,
    cancel: CancellationToken,
}

impl MirrorRun {
    pub fn new(
        config: Config,
        verifier: Arc<dyn ReleaseVerifier>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier,
            cancel,
        }
    }

    /// Execute the run to completion.
    ///
    /// Per-repository failures are captured in the report; only
    /// process-level conditions (lock contention, configuration, disk,
    /// interruption) surface as `Err`.
    pub async fn execute(&self) -> Result<RunReport> {
        let layout = Layout::from_config(&self.config);
        layout.ensure_directories()?;

        let _lock = LockFile::acquire(layout.var_root.join("apt-mirror.lock"))?;

        info!(
            "mirroring {} repository definition(s) with {} worker(s)",
            self.config.repositories.len(),
            self.config.nthreads
        );

        let fetcher = Arc::new(Fetcher::new(
            &self.config,
            layout.clone(),
            self.cancel.clone(),
        )?);

        let mut states = self
            .config
            .repositories
            .iter()
            .cloned()
            .map(RepoState::new)
            .collect::<Vec<_>>();

        self.release_stage(&fetcher, &layout, &mut states).await;
        self.ensure_not_cancelled()?;

        self.index_stage(&fetcher, &mut states).await;
        self.ensure_not_cancelled()?;

        let archive_queue = self.collect_archives(&layout, &mut states).await;
        self.ensure_not_cancelled()?;

        self.archive_stage(&fetcher, &mut states, archive_queue).await;
        self.ensure_not_cancelled()?;

        self.promote_metadata(&layout, &mut states);

        let clean_script = self.cleanup_stage(&layout, &states)?;

        let report = RunReport {
            repositories: states
                .into_iter()
                .map(|state| RepoReport {
                    label: state.repo.label(),
                    local_prefix: state.repo.local_prefix(),
                    error: state.error,
                })
                .collect(),
            clean_script,
        };

        if self.config.run_postmirror {
            self.run_postmirror(&layout, report.succeeded()).await;
        }

        Ok(report)
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(MirrorError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn release_stage(
        &self,
        fetcher: &Arc<Fetcher>,
        layout: &Layout,
        states: &mut [RepoState],
    ) {
        let progress = StageProgress::new("release", states.len(), 0);
        let ticker = spawn_ticker(progress.clone(), PROGRESS_PERIOD);

        let futures = states
            .iter()
            .enumerate()
            .map(|(idx, state)| {
                let repo = state.repo.clone();
                let fetcher = fetcher.clone();
                let layout = layout.clone();
                let verifier = self.verifier.clone();
                let config = self.config.clone();

                async move {
                    (
                        idx,
                        acquire_repository_metadata(&fetcher, &layout, &verifier, &config, &repo)
                            .await,
                    )
                }
            })
            .collect::<Vec<_>>();

        let mut stream = futures::stream::iter(futures).buffer_unordered(self.config.nthreads);
        let mut results = vec![];

        while let Some((idx, result)) = stream.next().await {
            match &result {
                Ok(_) => progress.record_success(0),
                Err(_) => progress.record_failure(),
            }
            results.push((idx, result));
        }

        drop(stream);
        progress.finish();
        ticker.abort();

        for (idx, result) in results {
            match result {
                Ok(metadata) => {
                    let state = &mut states[idx];
                    state.index_artifacts = metadata.index_artifacts;
                    state.parse_targets = metadata.parse_targets;
                    state.release_fetched = metadata.release_fetched;
                    state.wanted = metadata.wanted;
                }
                Err(e) => states[idx].fail(e),
            }
        }
    }

    async fn index_stage(&self, fetcher: &Arc<Fetcher>, states: &mut [RepoState]) {
        let mut queue = vec![];

        for (idx, state) in states.iter().enumerate() {
            if state.error.is_some() {
                continue;
            }

            let prefix = state.repo.local_prefix();

            for artifact in &state.index_artifacts {
                queue.push((
                    idx,
                    state.repo.root_url().clone(),
                    artifact.clone(),
                    Layout::local_rel(&prefix, &artifact.relative_path),
                ));
            }
        }

        let failures = self.run_fetch_stage("index", fetcher, queue).await;

        for (idx, error) in failures {
            states[idx].fail(error);
        }
    }

    /// Parse the selected index files of every healthy repository and
    /// build the global, deduplicated archive queue.
    async fn collect_archives(
        &self,
        layout: &Layout,
        states: &mut [RepoState],
    ) -> Vec<(Artifact, String, Vec<usize>)> {
        let mut dedupe: HashMap<String, usize> = HashMap::new();
        let mut queue: Vec<(Artifact, String, Vec<usize>)> = vec![];

        for idx in 0..states.len() {
            if states[idx].error.is_some() {
                continue;
            }

            let repo = states[idx].repo.clone();
            let prefix = repo.local_prefix();
            let dists = repo.dists_dir();

            let mut archives = vec![];
            let mut parse_error = None;

            for target in &states[idx].parse_targets {
                let rel = format!("{}/{}", dists, target.path);
                let skel = layout.skel_file(&Layout::local_rel(&prefix, &rel));

                match parse_index_file(&skel, target).await {
                    Ok(mut parsed) => archives.append(&mut parsed),
                    Err(e) => {
                        parse_error = Some(MirrorError::Repository {
                            repo: repo.label(),
                            message: format!("failed to parse {}: {}", rel, e),
                        });
                        break;
                    }
                }
            }

            if let Some(e) = parse_error {
                states[idx].fail(e);
                continue;
            }

            for artifact in archives {
                let local_rel = Layout::local_rel(&prefix, &artifact.relative_path);
                states[idx].wanted.insert(local_rel.clone());

                match dedupe.get(&local_rel) {
                    Some(&position) => queue[position].2.push(idx),
                    None => {
                        dedupe.insert(local_rel.clone(), queue.len());
                        queue.push((artifact, local_rel, vec![idx]));
                    }
                }
            }
        }

        queue
    }

    async fn archive_stage(
        &self,
        fetcher: &Arc<Fetcher>,
        states: &mut [RepoState],
        queue: Vec<(Artifact, String, Vec<usize>)>,
    ) {
        let mut fetches = vec![];
        let mut owners = vec![];

        for (artifact, local_rel, artifact_owners) in queue {
            // Any healthy owner's base URL serves the shared artifact.
            let Some(&owner) = artifact_owners
                .iter()
                .find(|&&idx| states[idx].error.is_none())
            else {
                continue;
            };

            fetches.push((
                owners.len(),
                states[owner].repo.root_url().clone(),
                artifact,
                local_rel,
            ));
            owners.push(artifact_owners);
        }

        let failures = self.run_fetch_stage("archive", fetcher, fetches).await;

        for (position, error) in failures {
            let mut error = Some(error);

            for &idx in &owners[position] {
                match error.take() {
                    Some(e) => states[idx].fail(e),
                    None => {
                        let report = MirrorError::Repository {
                            repo: states[idx].repo.label(),
                            message: "shared archive failed to download".to_string(),
                        };
                        states[idx].fail(report);
                    }
                }
            }
        }
    }

    /// Drive one stage's fetches through the bounded worker pool.
    ///
    /// Returns the tag of each failed fetch with its error.
    async fn run_fetch_stage(
        &self,
        stage: &'static str,
        fetcher: &Arc<Fetcher>,
        queue: Vec<(usize, url::Url, Artifact, String)>,
    ) -> Vec<(usize, MirrorError)> {
        let total_bytes = queue
            .iter()
            .map(|(_, _, artifact, _)| artifact.size.unwrap_or(0))
            .sum();

        let progress = StageProgress::new(stage, queue.len(), total_bytes);
        let ticker = spawn_ticker(progress.clone(), PROGRESS_PERIOD);

        let futures = queue
            .into_iter()
            .map(|(tag, repo_url, artifact, local_rel)| {
                let fetcher = fetcher.clone();

                async move {
                    let result = fetcher.fetch(&repo_url, &artifact, &local_rel).await;
                    (tag, result)
                }
            })
            .collect::<Vec<_>>();

        let mut stream = futures::stream::iter(futures).buffer_unordered(self.config.nthreads);
        let mut failures = vec![];

        while let Some((tag, result)) = stream.next().await {
            match result {
                Ok(outcome) => progress.record_success(outcome.bytes_fetched),
                Err(e) => {
                    progress.record_failure();
                    failures.push((tag, e));
                }
            }
        }

        drop(stream);
        progress.finish();
        ticker.abort();

        failures
    }

    /// Rename staged metadata into the live tree for fully successful
    /// repositories: indices first, release files last.
    fn promote_metadata(&self, layout: &Layout, states: &mut [RepoState]) {
        for state in states.iter_mut() {
            if state.error.is_some() {
                continue;
            }

            let prefix = state.repo.local_prefix();

            let index_rels = state
                .index_artifacts
                .iter()
                .map(|a| Layout::local_rel(&prefix, &a.relative_path))
                .collect::<Vec<_>>();

            // InRelease goes very last so clients never observe a release
            // referencing a not-yet-present index.
            let [inrelease, release, release_gpg] = state.repo.release_candidates();
            let release_rels = [release_gpg, release, inrelease]
                .into_iter()
                .filter(|rel| state.release_fetched.contains(rel))
                .map(|rel| Layout::local_rel(&prefix, &rel))
                .collect::<Vec<_>>();

            match layout.promote_metadata(&index_rels, &release_rels, self.config.unlink) {
                Ok(()) => {
                    info!(
                        "{}: promoted {} metadata file(s)",
                        state.repo.label(),
                        index_rels.len() + release_rels.len()
                    );
                }
                Err(e) => state.fail(e),
            }
        }
    }

    fn cleanup_stage(&self, layout: &Layout, states: &[RepoState]) -> Result<Option<PathBuf>> {
        if self.config.clean == CleanMode::Off || self.config.clean_prefixes.is_empty() {
            return Ok(None);
        }

        // Conservatism: a file wanted by any configured repository is
        // never deleted, whatever prefix it lives under.
        let keep = states
            .iter()
            .flat_map(|s| s.wanted.iter().cloned())
            .collect::<HashSet<_>>();

        let mut plans = vec![];

        'prefixes: for prefix in &self.config.clean_prefixes {
            for state in states {
                if state.error.is_some() && state.repo.local_prefix().starts_with(prefix.as_str())
                {
                    warn!(
                        "skipping cleanup under {}: repository {} did not complete",
                        prefix,
                        state.repo.label()
                    );
                    continue 'prefixes;
                }
            }

            plans.push(gc::plan_prefix(&layout.mirror_root, prefix, &keep)?);
        }

        let clean_script = if self.config.clean.writes_script() {
            let script = layout.var_root.join("clean.sh");
            gc::write_script(&script, &layout.mirror_root, &plans)?;
            Some(script)
        } else {
            None
        };

        if self.config.clean.unlinks() {
            for plan in &plans {
                let removed = gc::execute_plan(&layout.mirror_root, plan)?;

                if removed > 0 {
                    info!("removed {} unreferenced file(s) under {}", removed, plan.prefix);
                }
            }
        }

        Ok(clean_script)
    }

    async fn run_postmirror(&self, layout: &Layout, success: bool) {
        let script = &self.config.postmirror_script;

        if !script.is_file() {
            warn!("postmirror script not found: {}", script.display());
            return;
        }

        let mut command = if is_executable(script) {
            tokio::process::Command::new(script)
        } else {
            let mut command = tokio::process::Command::new("/bin/sh");
            command.arg(script);
            command
        };

        command
            .env("APT_MIRROR_MIRROR_PATH", &layout.mirror_root)
            .env("APT_MIRROR_SKEL_PATH", &layout.skel_root)
            .env("APT_MIRROR_VAR_PATH", &layout.var_root)
            .env("APT_MIRROR_RESULT", if success { "ok" } else { "failed" });

        // The hook's exit code never affects the run result.
        match command.status().await {
            Ok(status) if status.success() => info!("postmirror script completed"),
            Ok(status) => warn!("postmirror script exited with {}", status),
            Err(e) => warn!("failed to run postmirror script: {}", e),
        }
    }
}

/// Fetch, verify, and parse one repository's release metadata, emitting
/// its index artifact list and parse selection.
async fn acquire_repository_metadata(
    fetcher: &Fetcher,
    layout: &Layout,
    verifier: &Arc<dyn ReleaseVerifier>,
    config: &Config,
    repo: &Repository,
) -> Result<RepoMetadata> {
    let prefix = repo.local_prefix();
    let [inrelease, release, release_gpg] = repo.release_candidates();

    let mut release_fetched = vec![];
    let mut document: Option<(Vec<u8>, bool)> = None;
    let mut detached_signature: Option<Vec<u8>> = None;

    // Prefer the clear-signed InRelease; fall back to Release (+ .gpg).
    match fetcher
        .fetch(
            repo.root_url(),
            &Artifact::release(inrelease.clone()),
            &Layout::local_rel(&prefix, &inrelease),
        )
        .await
    {
        Ok(_) => {
            let bytes =
                tokio::fs::read(layout.skel_file(&Layout::local_rel(&prefix, &inrelease))).await?;
            release_fetched.push(inrelease.clone());
            document = Some((bytes, true));
        }
        Err(MirrorError::Download {
            kind: FetchErrorKind::NotFound,
            ..
        }) => {}
        Err(e) => return Err(e),
    }

    if document.is_none() {
        fetcher
            .fetch(
                repo.root_url(),
                &Artifact::release(release.clone()),
                &Layout::local_rel(&prefix, &release),
            )
            .await?;

        let bytes =
            tokio::fs::read(layout.skel_file(&Layout::local_rel(&prefix, &release))).await?;
        release_fetched.push(release.clone());
        document = Some((bytes, false));

        match fetcher
            .fetch(
                repo.root_url(),
                &Artifact::release(release_gpg.clone()),
                &Layout::local_rel(&prefix, &release_gpg),
            )
            .await
        {
            Ok(_) => {
                detached_signature = Some(
                    tokio::fs::read(layout.skel_file(&Layout::local_rel(&prefix, &release_gpg)))
                        .await?,
                );
                release_fetched.push(release_gpg.clone());
            }
            Err(MirrorError::Download {
                kind: FetchErrorKind::NotFound,
                ..
            }) => {}
            Err(e) => return Err(e),
        }
    }

    let (bytes, clearsigned) = document.expect("release document resolved above");

    if config.verify_gpg {
        let keyring = repo.keyring.as_deref().or(config.gpg_keyring.as_deref());

        if clearsigned {
            verifier
                .verify_clearsigned(&repo.label(), &bytes, keyring)
                .await?;
        } else if let Some(signature) = &detached_signature {
            verifier
                .verify_detached(&repo.label(), &bytes, signature, keyring)
                .await?;
        } else {
            return Err(MirrorError::SignatureVerification {
                repo: repo.label(),
                reason: "neither InRelease nor Release.gpg is available".to_string(),
            });
        }
    }

    let text = String::from_utf8_lossy(&bytes);
    let release_file = ReleaseFile::parse(&text)?;

    match release_file.valid_until() {
        Some(Ok(valid_until)) if valid_until < Utc::now() => {
            warn!(
                "{}: release metadata expired at {}",
                repo.label(),
                valid_until
            );
        }
        Some(Err(e)) => {
            warn!("{}: unparseable Valid-Until field: {}", repo.label(), e);
        }
        _ => {}
    }

    let index = release_file.file_index()?;
    let selector = repo.index_selector();
    let dists = repo.dists_dir();

    let mut wanted = HashSet::new();
    for rel in repo.release_candidates() {
        wanted.insert(Layout::local_rel(&prefix, &rel));
    }

    let mut index_artifacts = vec![];

    for (path, entry) in &index {
        if selector.matches(path) {
            let rel = format!("{}/{}", dists, path);
            wanted.insert(Layout::local_rel(&prefix, &rel));
            index_artifacts.push(Artifact::index(rel, entry.size, entry.digests.clone()));
        }
    }

    let parse_targets = selector.parse_targets(&index);

    info!(
        "{}: {} index file(s) selected, {} to parse",
        repo.label(),
        index_artifacts.len(),
        parse_targets.len()
    );

    Ok(RepoMetadata {
        index_artifacts,
        parse_targets,
        release_fetched,
        wanted,
    })
}

/// Read one staged index file, decompress it, and extract its archives.
async fn parse_index_file(skel_path: &Path, target: &ParseTarget) -> Result<Vec<Artifact>> {
    let raw = tokio::fs::read(skel_path).await?;
    let text = decompress(raw, target.compression).await?;
    let text = String::from_utf8_lossy(&text);

    match target.kind {
        ParseKind::BinaryPackages => indices::parse_binary_packages(&text),
        ParseKind::Sources => indices::parse_source_packages(&text),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
