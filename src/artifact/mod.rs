//! Physical artifact resolution.
//!
//! Maps a logical file reference recorded at ingestion (possibly from another
//! host, possibly percent-encoded) to a real file on this host. Results are
//! never cached or persisted: the same reference must resolve on whichever
//! host asks. "Unresolved" is an ordinary outcome, not an error.
//!
//! The resolver only reads the filesystem.

pub mod strategy;

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub use strategy::{default_chain, decode_once, ResolveContext, ResolveStrategy};

use crate::config::IngestConfig;

/// A confirmed, canonical artifact location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub path: PathBuf,
    /// Name of the strategy that produced the match.
    pub strategy: &'static str,
}

pub struct ArtifactResolver {
    ctx: ResolveContext,
    strategies: Vec<Box<dyn ResolveStrategy>>,
    confine: bool,
}

impl ArtifactResolver {
    pub fn new(root: impl Into<PathBuf>, anchor: impl Into<String>) -> Self {
        Self {
            ctx: ResolveContext::new(root, anchor),
            strategies: default_chain(),
            confine: false,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(&config.root_dir, &config.storage_anchor)
            .with_confinement(config.confine_to_storage)
    }

    /// Reject matches that canonicalize outside the storage root.
    pub fn with_confinement(mut self, confine: bool) -> Self {
        self.confine = confine;
        self
    }

    /// Replace the strategy chain.
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// First strategy whose candidate exists wins; later ones are not tried.
    pub fn resolve(&self, logical: &str) -> Option<Resolution> {
        if logical.trim().is_empty() {
            return None;
        }

        let storage_root = if self.confine {
            // Nothing can be inside a storage root that does not exist.
            Some(fs::canonicalize(self.ctx.storage_root()).ok()?)
        } else {
            None
        };

        for strategy in &self.strategies {
            let Some(candidate) = strategy.candidate(logical, &self.ctx) else {
                continue;
            };
            let Some(path) = existing_file(&candidate) else {
                continue;
            };
            if let Some(root) = &storage_root {
                if !path.starts_with(root) {
                    tracing::debug!(
                        reference = logical,
                        strategy = strategy.name(),
                        path = %path.display(),
                        "Candidate outside storage root, ignored"
                    );
                    continue;
                }
            }
            tracing::debug!(
                reference = logical,
                strategy = strategy.name(),
                path = %path.display(),
                "Artifact resolved"
            );
            return Some(Resolution {
                path,
                strategy: strategy.name(),
            });
        }

        tracing::debug!(reference = logical, "Artifact unresolved");
        None
    }
}

fn existing_file(candidate: &Path) -> Option<PathBuf> {
    let canonical = fs::canonicalize(candidate).ok()?;
    canonical.is_file().then_some(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        file: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        let sub = root.join("storage").join("sub dir");
        fs::create_dir_all(&sub).unwrap();
        let file = sub.join("name.jpg");
        fs::write(&file, b"jpeg").unwrap();
        Fixture {
            _dir: dir,
            root,
            file,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn latin1_file_names_resolve() {
        use std::os::unix::ffi::OsStrExt;
        let fx = fixture();
        let name = std::ffi::OsStr::from_bytes(b"caf\xe9.pdf");
        let file = fx.root.join("storage").join(name);
        fs::write(&file, b"pdf").unwrap();

        let resolution = ArtifactResolver::new(&fx.root, "storage")
            .resolve("storage/caf%E9.pdf")
            .unwrap();
        assert_eq!(resolution.path, file);
        assert_eq!(resolution.strategy, "anchor_prefix");
    }

    #[test]
    fn every_recorded_form_resolves_to_the_same_file() {
        let fx = fixture();
        let resolver = ArtifactResolver::new(&fx.root, "storage");

        let raw = fx.file.to_string_lossy().into_owned();
        let forms = [
            raw.as_str(),
            "/var/www/other-host/public/storage/sub%20dir/name.jpg",
            "storage/sub dir/name.jpg",
            "storage/sub%20dir/name.jpg",
            "/storage/sub%20dir/name.jpg",
            "sub%20dir/name.jpg",
        ];
        for form in forms {
            let resolution = resolver
                .resolve(form)
                .unwrap_or_else(|| panic!("{form} did not resolve"));
            assert_eq!(resolution.path, fx.file, "{form}");
        }
    }

    #[test]
    fn reports_the_winning_strategy() {
        let fx = fixture();
        let resolver = ArtifactResolver::new(&fx.root, "storage");
        assert_eq!(
            resolver
                .resolve(&fx.file.to_string_lossy())
                .unwrap()
                .strategy,
            "raw_literal"
        );
        assert_eq!(
            resolver
                .resolve("C:/old/host/storage/sub%20dir/name.jpg")
                .unwrap()
                .strategy,
            "anchor_split"
        );
        assert_eq!(
            resolver.resolve("storage/sub dir/name.jpg").unwrap().strategy,
            "anchor_prefix"
        );
        assert_eq!(
            resolver.resolve("sub dir/name.jpg").unwrap().strategy,
            "storage_relative"
        );
    }

    #[test]
    fn absent_file_is_no_match() {
        let fx = fixture();
        let resolver = ArtifactResolver::new(&fx.root, "storage");
        assert!(resolver.resolve("storage/sub dir/missing.jpg").is_none());
        assert!(resolver.resolve("/elsewhere/storage/nothing.pdf").is_none());
        assert!(resolver.resolve("").is_none());
        assert!(resolver.resolve("   ").is_none());
    }

    #[test]
    fn directories_are_not_artifacts() {
        let fx = fixture();
        let resolver = ArtifactResolver::new(&fx.root, "storage");
        assert!(resolver.resolve("storage/sub dir").is_none());
    }

    #[test]
    fn literal_percent_sequence_is_decoded_only_once() {
        let fx = fixture();
        let storage = fx.root.join("storage");
        let literal = storage.join("a%20b.txt");
        fs::write(&literal, b"literal").unwrap();
        fs::write(storage.join("a b.txt"), b"decoy").unwrap();
        let resolver = ArtifactResolver::new(&fx.root, "storage");

        // One decode of %2520 yields the literal %20 name; a second decode
        // would land on the decoy.
        let resolution = resolver.resolve("storage/a%2520b.txt").unwrap();
        assert_eq!(resolution.path, literal);

        let resolution = resolver.resolve("/other/storage/a%2520b.txt").unwrap();
        assert_eq!(resolution.path, literal);
    }

    #[test]
    fn confinement_rejects_escapes() {
        let fx = fixture();
        let outside = fx.root.join("secrets.txt");
        fs::write(&outside, b"x").unwrap();

        let open = ArtifactResolver::new(&fx.root, "storage");
        assert!(open.resolve("storage/../secrets.txt").is_some());

        let confined = ArtifactResolver::new(&fx.root, "storage").with_confinement(true);
        assert!(confined.resolve("storage/../secrets.txt").is_none());
        assert!(confined.resolve(&outside.to_string_lossy()).is_none());
        assert_eq!(
            confined.resolve("storage/sub dir/name.jpg").unwrap().path,
            fx.file
        );
    }

    #[test]
    fn confinement_without_storage_root_matches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pdf");
        fs::write(&file, b"%PDF").unwrap();
        let confined = ArtifactResolver::new(dir.path(), "storage").with_confinement(true);
        assert!(confined.resolve(&file.to_string_lossy()).is_none());
    }

    #[test]
    fn custom_chain_replaces_defaults() {
        let fx = fixture();
        let resolver = ArtifactResolver::new(&fx.root, "storage")
            .with_strategies(vec![Box::new(strategy::StorageRelative)]);
        assert!(resolver.resolve("storage/sub dir/name.jpg").is_none());
        assert!(resolver.resolve("sub dir/name.jpg").is_some());
    }
}
