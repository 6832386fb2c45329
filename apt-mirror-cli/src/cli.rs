// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apt_mirror::{
        config::Config,
        error::MirrorError,
        run::MirrorRun,
        signature::{AcceptAllVerifier, GpgvVerifier, ReleaseVerifier},
    },
    clap::{Arg, Command},
    std::{path::PathBuf, sync::Arc},
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
};

/// Exit codes, kept stable for scripting.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_LOCKED: i32 = 2;
const EXIT_FAILED: i32 = 3;
const EXIT_SIGNATURE: i32 = 4;

pub async fn run_cli() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let matches = Command::new("apt-mirror")
        .about("Mirror APT repositories onto local storage")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .default_value("/etc/apt/mirror.list")
                .help("Path to the mirror.list configuration file"),
        )
        .get_matches();

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .expect("argument has a default"),
    );

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return EXIT_CONFIG;
        }
    };

    if config.repositories.is_empty() {
        error!("{}: no deb or deb-src lines configured", config_path.display());
        return EXIT_CONFIG;
    }

    let verifier: Arc<dyn ReleaseVerifier> = if config.verify_gpg {
        Arc::new(GpgvVerifier::default())
    } else {
        Arc::new(AcceptAllVerifier)
    };

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; letting in-flight downloads wind down");
                cancel.cancel();
            }
        });
    }

    let run = MirrorRun::new(config, verifier, cancel);

    match run.execute().await {
        Ok(report) => {
            for repo in &report.repositories {
                match &repo.error {
                    None => info!("{}: ok", repo.label),
                    Some(e) => error!("{}: failed: {}", repo.label, e),
                }
            }

            if let Some(script) = &report.clean_script {
                info!("cleanup plan written to {}", script.display());
            }

            if report.succeeded() {
                EXIT_OK
            } else if report.has_signature_failure() {
                EXIT_SIGNATURE
            } else {
                EXIT_FAILED
            }
        }
        Err(MirrorError::LockContention(path)) => {
            error!("another run is active (lock file {} exists)", path.display());
            EXIT_LOCKED
        }
        Err(e @ MirrorError::Config { .. }) => {
            error!("configuration error: {}", e);
            EXIT_CONFIG
        }
        Err(e) => {
            error!("run failed: {}", e);
            EXIT_FAILED
        }
    }
}
