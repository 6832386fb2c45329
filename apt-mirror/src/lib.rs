// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! APT repository mirroring engine.

This crate synchronizes Debian/Ubuntu-style APT repositories onto local
storage, producing a byte-exact, directory-structure-preserving replica
suitable for serving by a plain HTTP server.

# A Tour of Functionality

Configuration comes from a `mirror.list` file parsed by [config::Config]:
`set` directives, `deb`/`deb-src` repository lines, and `clean` cleanup
opt-ins. Each repository line becomes a [repository::Repository], which
plans the canonical metadata paths for its suite and filters the index
files listed by the upstream `Release` to the configured components and
architectures.

Repository metadata is expressed as control files. Low-level parsing
primitives live in [control]; [release::ReleaseFile] wraps a parsed
`[In]Release` file and consolidates its checksum blocks into one
per-path index, and [indices] extracts pool file references from
`Packages` and `Sources` indices.

Downloading goes through [fetch::Fetcher]: a bounded pool of workers
streams each artifact through its strongest declared digest
([io::ArtifactDigester]) into a `.partial` file, resumes interrupted
transfers with `Range` requests, retries transient failures with
exponential backoff, and paces all transfers through one
[ratelimit::RateLimiter] token bucket. Completed files are renamed into
place by [staging::Layout]; metadata stages under `skel/` and is
promoted into `mirror/` only after its repository fully succeeds, with
`Release` files renamed last.

`InRelease`/`Release.gpg` signature checking is delegated to an external
`gpgv` binary behind the [signature::ReleaseVerifier] trait.

After a successful run, [gc] diffs the live tree against the wanted-set
accumulated from metadata and either writes `var/clean.sh` or unlinks
unreferenced files directly.

[run::MirrorRun] ties the stages together under an exclusive
[lock::LockFile] and reports per-repository outcomes.
*/

pub mod artifact;
pub mod config;
pub mod control;
pub mod error;
pub mod fetch;
pub mod gc;
pub mod indices;
pub mod io;
pub mod lock;
pub mod progress;
pub mod ratelimit;
pub mod release;
pub mod repository;
pub mod run;
pub mod signature;
pub mod staging;
