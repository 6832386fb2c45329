// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration loading.
//!
//! Configuration lives in a `mirror.list` file (plus optional
//! `mirror.list.d/*.list` drop-ins) holding `set <key> <value>` directives,
//! `deb`/`deb-src` repository lines, and `clean <base-url>` directives.
//! `$name` references expand to previously `set` values.
//!
//! All recognized keys land in the typed [Config] record; unknown keys warn
//! and are ignored for forward compatibility.

use {
    crate::{
        error::{MirrorError, Result},
        repository::Repository,
    },
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
        time::Duration,
    },
    tracing::warn,
    url::Url,
};

/// What to do with files no longer referenced by repository metadata.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CleanMode {
    /// Leave unreferenced files alone.
    Off,
    /// Write a `clean.sh` script listing removals.
    #[default]
    On,
    /// Unlink unreferenced files immediately.
    Auto,
    /// Write `clean.sh` and unlink.
    Both,
}

impl CleanMode {
    pub fn writes_script(&self) -> bool {
        matches!(self, Self::On | Self::Both)
    }

    pub fn unlinks(&self) -> bool {
        matches!(self, Self::Auto | Self::Both)
    }
}

/// The immutable configuration record for one run.
#[derive(Clone, Debug)]
pub struct Config {
    pub base_path: PathBuf,
    pub mirror_path: PathBuf,
    pub skel_path: PathBuf,
    pub var_path: PathBuf,
    pub defaultarch: String,
    pub nthreads: usize,
    /// Global download rate cap in bytes/sec. [None] means unlimited.
    pub limit_rate: Option<u64>,
    /// Unlink destination files before overwriting (hardlink protection).
    pub unlink: bool,
    pub use_proxy: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,
    /// Enforce index-declared hashes on archive files.
    pub verify_checksums: bool,
    /// Verify `InRelease`/`Release.gpg` signatures via the external verifier.
    pub verify_gpg: bool,
    pub gpg_keyring: Option<PathBuf>,
    pub resume_partial_downloads: bool,
    pub retry_attempts: u32,
    /// Base backoff delay in seconds.
    pub retry_delay: f64,
    pub clean: CleanMode,
    pub run_postmirror: bool,
    pub postmirror_script: PathBuf,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub repositories: Vec<Repository>,
    /// Local directory prefixes (under `mirror/`) opted into cleanup.
    pub clean_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let base = PathBuf::from("/var/spool/apt-mirror");

        Self {
            mirror_path: base.join("mirror"),
            skel_path: base.join("skel"),
            var_path: base.join("var"),
            postmirror_script: base.join("var/postmirror.sh"),
            base_path: base,
            defaultarch: host_architecture().to_string(),
            nthreads: 20,
            limit_rate: None,
            unlink: false,
            use_proxy: false,
            http_proxy: None,
            https_proxy: None,
            proxy_user: None,
            proxy_password: None,
            verify_checksums: true,
            verify_gpg: false,
            gpg_keyring: None,
            resume_partial_downloads: true,
            retry_attempts: 5,
            retry_delay: 2.0,
            clean: CleanMode::On,
            run_postmirror: false,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            repositories: vec![],
            clean_prefixes: vec![],
        }
    }
}

impl Config {
    /// Load configuration from a `mirror.list` file.
    ///
    /// A sibling `<file>.d/` directory's `*.list` entries are parsed
    /// afterwards in lexical order.
    pub fn load(path: &Path) -> Result<Self> {
        let mut loader = Loader::default();
        loader.read_file(path)?;

        let dropin_dir = PathBuf::from(format!("{}.d", path.display()));
        if dropin_dir.is_dir() {
            let mut entries = std::fs::read_dir(&dropin_dir)?
                .collect::<std::io::Result<Vec<_>>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| p.extension().map_or(false, |ext| ext == "list"))
                .collect::<Vec<_>>();
            entries.sort();

            for entry in entries {
                loader.read_file(&entry)?;
            }
        }

        loader.finish()
    }
}

/// Map the host architecture onto the Debian architecture name.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
}

const KNOWN_KEYS: &[&str] = &[
    "base_path",
    "mirror_path",
    "skel_path",
    "var_path",
    "defaultarch",
    "nthreads",
    "limit_rate",
    "unlink",
    "use_proxy",
    "http_proxy",
    "https_proxy",
    "proxy_user",
    "proxy_password",
    "verify_checksums",
    "verify_gpg",
    "gpg_keyring",
    "resume_partial_downloads",
    "retry_attempts",
    "retry_delay",
    "clean",
    "run_postmirror",
    "postmirror_script",
    "connect_timeout",
    "idle_timeout",
];

#[derive(Clone, Debug)]
struct SourceLine {
    path: PathBuf,
    line: usize,
    text: String,
}

#[derive(Debug, Default)]
struct Loader {
    vars: BTreeMap<String, SourceLine>,
    deb_lines: Vec<SourceLine>,
    clean_lines: Vec<SourceLine>,
}

impl Loader {
    fn read_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| MirrorError::Config {
            path: path.to_path_buf(),
            line: 0,
            message: format!("cannot read configuration: {}", e),
        })?;

        for (number, raw) in content.lines().enumerate() {
            let line = raw.trim();
            let number = number + 1;

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let source = |text: &str| SourceLine {
                path: path.to_path_buf(),
                line: number,
                text: text.to_string(),
            };

            if let Some(rest) = line.strip_prefix("set ") {
                let mut parts = rest.trim().splitn(2, char::is_whitespace);
                let key = parts.next().unwrap_or_default();
                let value = parts.next().unwrap_or_default().trim();
                let value = value.trim_matches(|c| c == '"' || c == '\'');

                if key.is_empty() || value.is_empty() {
                    return Err(MirrorError::Config {
                        path: path.to_path_buf(),
                        line: number,
                        message: format!("malformed set directive: {}", line),
                    });
                }

                if !KNOWN_KEYS.contains(&key) {
                    warn!("{}:{}: unknown configuration key: {}", path.display(), number, key);
                    continue;
                }

                self.vars.insert(key.to_string(), source(value));
            } else if let Some(rest) = line.strip_prefix("clean ") {
                self.clean_lines.push(source(rest.trim()));
            } else if line.starts_with("deb") {
                self.deb_lines.push(source(line));
            } else {
                warn!(
                    "{}:{}: unrecognized configuration line: {}",
                    path.display(),
                    number,
                    line
                );
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<Config> {
        // Seed with the defaults every installation shares, then overlay
        // user values and expand $references to a fixpoint.
        let mut values: BTreeMap<String, String> = BTreeMap::from([
            ("base_path".to_string(), "/var/spool/apt-mirror".to_string()),
            ("mirror_path".to_string(), "$base_path/mirror".to_string()),
            ("skel_path".to_string(), "$base_path/skel".to_string()),
            ("var_path".to_string(), "$base_path/var".to_string()),
            (
                "postmirror_script".to_string(),
                "$var_path/postmirror.sh".to_string(),
            ),
        ]);

        for (key, source) in &self.vars {
            values.insert(key.clone(), source.text.clone());
        }

        let expanded: BTreeMap<String, String> = values
            .keys()
            .map(|key| (key.clone(), expand_vars(&values[key], &values)))
            .collect();

        let mut config = Config::default();

        for (key, value) in &expanded {
            self.apply_key(&mut config, key, value)?;
        }

        config.base_path = PathBuf::from(&expanded["base_path"]);
        config.mirror_path = PathBuf::from(&expanded["mirror_path"]);
        config.skel_path = PathBuf::from(&expanded["skel_path"]);
        config.var_path = PathBuf::from(&expanded["var_path"]);
        config.postmirror_script = PathBuf::from(&expanded["postmirror_script"]);

        for source in &self.deb_lines {
            let line = expand_vars(&source.text, &values);
            let repo = parse_deb_line(&line, &config.defaultarch).map_err(|message| {
                MirrorError::Config {
                    path: source.path.clone(),
                    line: source.line,
                    message,
                }
            })?;

            match config
                .repositories
                .iter_mut()
                .find(|existing| existing.merge_key() == repo.merge_key())
            {
                Some(existing) => existing.absorb(repo),
                None => config.repositories.push(repo),
            }
        }

        for source in &self.clean_lines {
            let line = expand_vars(&source.text, &values);
            let url = Url::parse(line.trim()).map_err(|e| MirrorError::Config {
                path: source.path.clone(),
                line: source.line,
                message: format!("invalid clean URL '{}': {}", line.trim(), e),
            })?;

            let prefix = Repository::local_prefix_for_url(&url);
            if !config.clean_prefixes.contains(&prefix) {
                config.clean_prefixes.push(prefix);
            }
        }

        Ok(config)
    }

    fn apply_key(&self, config: &mut Config, key: &str, value: &str) -> Result<()> {
        let fail = |message: String| -> MirrorError {
            match self.vars.get(key) {
                Some(source) => MirrorError::Config {
                    path: source.path.clone(),
                    line: source.line,
                    message,
                },
                None => MirrorError::Config {
                    path: PathBuf::new(),
                    line: 0,
                    message,
                },
            }
        };

        match key {
            // Path keys are applied after expansion in finish().
            "base_path" | "mirror_path" | "skel_path" | "var_path" | "postmirror_script" => {}

            "defaultarch" => config.defaultarch = value.to_string(),
            "nthreads" => {
                config.nthreads = value
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| fail(format!("nthreads must be a positive integer: {}", value)))?;
            }
            "limit_rate" => {
                config.limit_rate = parse_rate(value).map_err(fail)?;
            }
            "unlink" => config.unlink = parse_bool(value).map_err(fail)?,
            "use_proxy" => config.use_proxy = parse_bool(value).map_err(fail)?,
            "http_proxy" => config.http_proxy = Some(value.to_string()),
            "https_proxy" => config.https_proxy = Some(value.to_string()),
            "proxy_user" => config.proxy_user = Some(value.to_string()),
            "proxy_password" => config.proxy_password = Some(value.to_string()),
            "verify_checksums" => config.verify_checksums = parse_bool(value).map_err(fail)?,
            "verify_gpg" => config.verify_gpg = parse_bool(value).map_err(fail)?,
            "gpg_keyring" => config.gpg_keyring = Some(PathBuf::from(value)),
            "resume_partial_downloads" => {
                config.resume_partial_downloads = parse_bool(value).map_err(fail)?;
            }
            "retry_attempts" => {
                config.retry_attempts = value
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| {
                        fail(format!("retry_attempts must be a positive integer: {}", value))
                    })?;
            }
            "retry_delay" => {
                config.retry_delay = value
                    .parse::<f64>()
                    .ok()
                    .filter(|d| *d >= 0.0)
                    .ok_or_else(|| fail(format!("retry_delay must be non-negative: {}", value)))?;
            }
            "clean" => {
                config.clean = match value {
                    "off" => CleanMode::Off,
                    "on" => CleanMode::On,
                    "auto" => CleanMode::Auto,
                    "both" => CleanMode::Both,
                    other => {
                        return Err(fail(format!(
                            "clean must be off, on, auto, or both: {}",
                            other
                        )));
                    }
                };
            }
            "run_postmirror" => config.run_postmirror = parse_bool(value).map_err(fail)?,
            "connect_timeout" => {
                config.connect_timeout = Duration::from_secs(
                    value
                        .parse::<u64>()
                        .map_err(|_| fail(format!("connect_timeout must be seconds: {}", value)))?,
                );
            }
            "idle_timeout" => {
                config.idle_timeout = Duration::from_secs(
                    value
                        .parse::<u64>()
                        .map_err(|_| fail(format!("idle_timeout must be seconds: {}", value)))?,
                );
            }
            _ => {}
        }

        Ok(())
    }
}

/// Expand `$name` references against the configured value map.
///
/// Substitution iterates to a fixpoint with a bounded depth, matching
/// longer keys first so `$base_path` is never clipped by a shorter key.
fn expand_vars(value: &str, values: &BTreeMap<String, String>) -> String {
    let mut keys = values.keys().collect::<Vec<_>>();
    keys.sort_by_key(|k| std::cmp::Reverse(k.len()));

    let mut out = value.to_string();

    for _ in 0..16 {
        if !out.contains('$') {
            break;
        }

        let mut next = out.clone();
        for key in &keys {
            if next.contains('$') {
                next = next.replace(&format!("${}", key), &values[key.as_str()]);
            }
        }

        if next == out {
            break;
        }
        out = next;
    }

    out
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "on" | "true" => Ok(true),
        "0" | "no" | "off" | "false" => Ok(false),
        other => Err(format!("expected a boolean value: {}", other)),
    }
}

fn parse_rate(value: &str) -> std::result::Result<Option<u64>, String> {
    let value = value.trim();

    if value == "0" || value.eq_ignore_ascii_case("unlimited") {
        return Ok(None);
    }

    let (number, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1024u64),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        _ => (value, 1),
    };

    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid rate limit: {}", value))?;

    Ok(Some(number * multiplier))
}

/// Parse one `deb`/`deb-src` line into a [Repository].
///
/// Accepted forms:
///
/// ```text
/// deb [arch=amd64,arm64 signed-by=/path.gpg] http://host/path suite comp1 comp2
/// deb-src http://host/path suite comp1
/// deb-arm64 http://host/path suite comp1
/// ```
fn parse_deb_line(line: &str, defaultarch: &str) -> std::result::Result<Repository, String> {
    let tokens = line.split_whitespace().collect::<Vec<_>>();
    let mut tokens = tokens.into_iter();

    let kind = tokens.next().ok_or_else(|| "empty deb line".to_string())?;

    let (is_source, line_arch) = match kind {
        "deb" => (false, None),
        "deb-src" => (true, None),
        other => match other.strip_prefix("deb-") {
            Some(arch) if !arch.is_empty() => (false, Some(arch.to_string())),
            _ => return Err(format!("unrecognized repository line type: {}", other)),
        },
    };

    let mut next = tokens
        .next()
        .ok_or_else(|| "repository line is missing a URL".to_string())?;

    // Bracketed options may span several whitespace-separated tokens.
    let mut architectures: Vec<String> = vec![];
    let mut keyring = None;

    if next.starts_with('[') {
        let mut options = next.to_string();

        while !options.ends_with(']') {
            let part = tokens
                .next()
                .ok_or_else(|| "unterminated repository options".to_string())?;
            options.push(' ');
            options.push_str(part);
        }

        for option in options
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split_whitespace()
        {
            let (name, value) = option
                .split_once('=')
                .ok_or_else(|| format!("malformed repository option: {}", option))?;

            match name {
                "arch" => {
                    architectures = value
                        .split(',')
                        .filter(|a| !a.is_empty())
                        .map(|a| a.to_string())
                        .collect();
                }
                "signed-by" => keyring = Some(PathBuf::from(value)),
                other => return Err(format!("unsupported repository option: {}", other)),
            }
        }

        next = tokens
            .next()
            .ok_or_else(|| "repository line is missing a URL".to_string())?;
    }

    let url = next;
    let suite = tokens
        .next()
        .ok_or_else(|| "repository line is missing a suite".to_string())?;
    let components = tokens.map(|c| c.to_string()).collect::<Vec<_>>();

    if components.is_empty() {
        return Err("repository line is missing components".to_string());
    }

    if architectures.is_empty() {
        architectures.push(line_arch.unwrap_or_else(|| defaultarch.to_string()));
    }

    Repository::new(url, suite, components, architectures, is_source, keyring)
        .map_err(|e| format!("invalid repository URL '{}': {}", url, e))
}

#[cfg(test)]
mod test {
    use super::*;

    fn load_str(content: &str) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.list");
        std::fs::write(&path, content).unwrap();
        Config::load(&path)
    }

    #[test]
    fn defaults() -> Result<()> {
        let config = load_str("deb http://h/ubuntu noble main\n")?;

        assert_eq!(config.base_path, PathBuf::from("/var/spool/apt-mirror"));
        assert_eq!(
            config.mirror_path,
            PathBuf::from("/var/spool/apt-mirror/mirror")
        );
        assert_eq!(config.nthreads, 20);
        assert_eq!(config.retry_attempts, 5);
        assert!(config.verify_checksums);
        assert!(!config.verify_gpg);
        assert!(config.resume_partial_downloads);
        assert_eq!(config.clean, CleanMode::On);
        assert!(config.limit_rate.is_none());

        Ok(())
    }

    #[test]
    fn variable_expansion() -> Result<()> {
        let config = load_str(
            "set base_path /srv/mirror\nset postmirror_script $var_path/hook.sh\ndeb http://h/d s main\n",
        )?;

        assert_eq!(config.mirror_path, PathBuf::from("/srv/mirror/mirror"));
        assert_eq!(config.var_path, PathBuf::from("/srv/mirror/var"));
        assert_eq!(
            config.postmirror_script,
            PathBuf::from("/srv/mirror/var/hook.sh")
        );

        Ok(())
    }

    #[test]
    fn typed_values() -> Result<()> {
        let config = load_str(
            "set nthreads 4\nset limit_rate 100k\nset unlink 1\nset clean both\nset retry_delay 0.5\nset defaultarch riscv64\ndeb http://h/d s main\n",
        )?;

        assert_eq!(config.nthreads, 4);
        assert_eq!(config.limit_rate, Some(100 * 1024));
        assert!(config.unlink);
        assert_eq!(config.clean, CleanMode::Both);
        assert_eq!(config.retry_delay, 0.5);
        assert_eq!(config.repositories[0].architectures, vec!["riscv64"]);

        Ok(())
    }

    #[test]
    fn rate_suffixes() {
        assert_eq!(parse_rate("500"), Ok(Some(500)));
        assert_eq!(parse_rate("2k"), Ok(Some(2048)));
        assert_eq!(parse_rate("3M"), Ok(Some(3 * 1024 * 1024)));
        assert_eq!(parse_rate("0"), Ok(None));
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn deb_line_options() {
        let repo = parse_deb_line(
            "deb [arch=amd64,arm64 signed-by=/etc/keyring.gpg] http://h/ubuntu noble main universe",
            "amd64",
        )
        .unwrap();

        assert_eq!(repo.suite, "noble");
        assert_eq!(repo.components, vec!["main", "universe"]);
        assert_eq!(repo.architectures, vec!["amd64", "arm64"]);
        assert_eq!(repo.keyring, Some(PathBuf::from("/etc/keyring.gpg")));
        assert!(repo.mirror_binary);
        assert!(!repo.mirror_source);
    }

    #[test]
    fn deb_arch_suffix_form() {
        let repo = parse_deb_line("deb-arm64 http://h/ubuntu noble main", "amd64").unwrap();
        assert_eq!(repo.architectures, vec!["arm64"]);
    }

    #[test]
    fn deb_lines_merge() -> Result<()> {
        let config = load_str(
            "deb http://h/ubuntu noble main\ndeb http://h/ubuntu noble universe\ndeb-src http://h/ubuntu noble main\n",
        )?;

        assert_eq!(config.repositories.len(), 1);
        let repo = &config.repositories[0];
        assert_eq!(repo.components, vec!["main", "universe"]);
        assert!(repo.mirror_binary);
        assert!(repo.mirror_source);

        Ok(())
    }

    #[test]
    fn clean_directives() -> Result<()> {
        let config = load_str(
            "deb http://h/ubuntu noble main\nclean http://h/ubuntu\nclean http://h/ubuntu\n",
        )?;

        assert_eq!(config.clean_prefixes, vec!["h/ubuntu".to_string()]);

        Ok(())
    }

    #[test]
    fn malformed_lines_error() {
        assert!(load_str("deb http://h/ubuntu\n").is_err());
        assert!(load_str("set nthreads many\ndeb http://h/d s main\n").is_err());
        assert!(load_str("clean notaurl\ndeb http://h/d s main\n").is_err());
    }

    #[test]
    fn comments_and_unknown_keys_ignored() -> Result<()> {
        let config = load_str(
            "# comment\nset some_future_knob 1\n\ndeb http://h/d s main\n",
        )?;

        assert_eq!(config.repositories.len(), 1);

        Ok(())
    }

    #[test]
    fn dropin_files_are_loaded_in_order() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.list");
        std::fs::write(&path, "deb http://a/d s main\n").unwrap();

        let dropins = dir.path().join("mirror.list.d");
        std::fs::create_dir(&dropins).unwrap();
        std::fs::write(dropins.join("10-b.list"), "deb http://b/d s main\n").unwrap();
        std::fs::write(dropins.join("20-c.list"), "deb http://c/d s main\n").unwrap();
        std::fs::write(dropins.join("ignored.txt"), "not parsed\n").unwrap();

        let config = Config::load(&path)?;
        let hosts = config
            .repositories
            .iter()
            .map(|r| r.root_url().host_str().unwrap().to_string())
            .collect::<Vec<_>>();

        assert_eq!(hosts, vec!["a", "b", "c"]);

        Ok(())
    }
}
