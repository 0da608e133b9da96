//! Ordered candidate strategies for locating an artifact on this host.
//!
//! Each strategy turns a logical reference into at most one candidate path.
//! Strategies never touch the filesystem; the resolver does the existence
//! check. Percent-decoding happens at most once per candidate.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════

/// Where this host keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveContext {
    /// Application root on this host.
    pub root: PathBuf,
    /// Well-known segment marking the storage tree (`storage`).
    pub anchor: String,
}

impl ResolveContext {
    pub fn new(root: impl Into<PathBuf>, anchor: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            anchor: anchor.into(),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.root.join(&self.anchor)
    }
}

pub trait ResolveStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn candidate(&self, logical: &str, ctx: &ResolveContext) -> Option<PathBuf>;
}

/// Single percent-decode into a path.
///
/// On Unix the decoded bytes become the file name as-is, so Latin-1 names
/// (`caf%E9.pdf`) still resolve. Elsewhere non-UTF-8 results are `None`.
pub fn decode_once(raw: &str) -> Option<PathBuf> {
    bytes_to_path(raw, urlencoding::decode_binary(raw.as_bytes()).into_owned())
}

#[cfg(unix)]
fn bytes_to_path(_raw: &str, bytes: Vec<u8>) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStringExt;
    Some(PathBuf::from(std::ffi::OsString::from_vec(bytes)))
}

#[cfg(not(unix))]
fn bytes_to_path(raw: &str, bytes: Vec<u8>) -> Option<PathBuf> {
    match String::from_utf8(bytes) {
        Ok(decoded) => Some(PathBuf::from(decoded)),
        Err(e) => {
            tracing::debug!(reference = raw, error = %e, "Reference does not decode to UTF-8");
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════

/// The reference exactly as recorded, no decoding.
pub struct RawLiteral;

impl ResolveStrategy for RawLiteral {
    fn name(&self) -> &'static str {
        "raw_literal"
    }

    fn candidate(&self, logical: &str, _ctx: &ResolveContext) -> Option<PathBuf> {
        Some(PathBuf::from(logical))
    }
}

/// Everything after an embedded `/<anchor>/`, re-rooted under this host's
/// storage tree. Recovers absolute paths written on another machine.
pub struct AnchorSplit;

impl ResolveStrategy for AnchorSplit {
    fn name(&self) -> &'static str {
        "anchor_split"
    }

    fn candidate(&self, logical: &str, ctx: &ResolveContext) -> Option<PathBuf> {
        let marker = format!("/{}/", ctx.anchor);
        let (_, rest) = logical.split_once(&marker)?;
        if rest.is_empty() {
            return None;
        }
        Some(ctx.storage_root().join(decode_once(rest)?))
    }
}

/// `<anchor>/...` with no leading slash, joined under the application root.
pub struct AnchorPrefix;

impl ResolveStrategy for AnchorPrefix {
    fn name(&self) -> &'static str {
        "anchor_prefix"
    }

    fn candidate(&self, logical: &str, ctx: &ResolveContext) -> Option<PathBuf> {
        let prefix = format!("{}/", ctx.anchor);
        if !logical.starts_with(&prefix) {
            return None;
        }
        Some(ctx.root.join(decode_once(logical)?))
    }
}

/// Leading slashes stripped, joined under the application root.
pub struct RootRelative;

impl ResolveStrategy for RootRelative {
    fn name(&self) -> &'static str {
        "root_relative"
    }

    fn candidate(&self, logical: &str, ctx: &ResolveContext) -> Option<PathBuf> {
        let relative = logical.trim_start_matches('/');
        if relative.is_empty() {
            return None;
        }
        Some(ctx.root.join(decode_once(relative)?))
    }
}

/// Bare file names or partial paths, joined under the storage root.
pub struct StorageRelative;

impl ResolveStrategy for StorageRelative {
    fn name(&self) -> &'static str {
        "storage_relative"
    }

    fn candidate(&self, logical: &str, ctx: &ResolveContext) -> Option<PathBuf> {
        let relative = logical.trim_start_matches('/');
        if relative.is_empty() {
            return None;
        }
        Some(ctx.storage_root().join(decode_once(relative)?))
    }
}

/// Strategies in evaluation order.
pub fn default_chain() -> Vec<Box<dyn ResolveStrategy>> {
    vec![
        Box::new(RawLiteral),
        Box::new(AnchorSplit),
        Box::new(AnchorPrefix),
        Box::new(RootRelative),
        Box::new(StorageRelative),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn ctx() -> ResolveContext {
        ResolveContext::new("/srv/app", "storage")
    }

    #[test]
    fn anchor_split_reroots_foreign_prefix() {
        let candidate = AnchorSplit
            .candidate("/home/alice/site/storage/sub%20dir/a.jpg", &ctx())
            .unwrap();
        assert_eq!(candidate, Path::new("/srv/app/storage/sub dir/a.jpg"));
    }

    #[test]
    fn anchor_split_requires_marker() {
        assert!(AnchorSplit.candidate("storage/a.jpg", &ctx()).is_none());
        assert!(AnchorSplit.candidate("/x/storage/", &ctx()).is_none());
    }

    #[test]
    fn anchor_prefix_only_matches_bare_anchor() {
        assert_eq!(
            AnchorPrefix.candidate("storage/a.jpg", &ctx()).unwrap(),
            Path::new("/srv/app/storage/a.jpg")
        );
        assert!(AnchorPrefix.candidate("/storage/a.jpg", &ctx()).is_none());
        assert!(AnchorPrefix.candidate("storagex/a.jpg", &ctx()).is_none());
    }

    #[test]
    fn root_relative_strips_leading_slashes() {
        assert_eq!(
            RootRelative.candidate("//docs/a%20b.pdf", &ctx()).unwrap(),
            Path::new("/srv/app/docs/a b.pdf")
        );
        assert!(RootRelative.candidate("/", &ctx()).is_none());
    }

    #[test]
    fn raw_literal_is_not_decoded() {
        assert_eq!(
            RawLiteral.candidate("/a%20b", &ctx()).unwrap(),
            Path::new("/a%20b")
        );
    }

    #[test]
    fn decode_happens_once() {
        assert_eq!(decode_once("a%2520b"), Some(PathBuf::from("a%20b")));
        assert_eq!(decode_once("a%20b"), Some(PathBuf::from("a b")));
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_decodes_to_raw_bytes() {
        use std::os::unix::ffi::OsStrExt;
        let decoded = decode_once("caf%E9.pdf").unwrap();
        assert_eq!(decoded.as_os_str().as_bytes(), b"caf\xe9.pdf");
    }

    #[test]
    fn chain_order_is_fixed() {
        let names: Vec<_> = default_chain().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            [
                "raw_literal",
                "anchor_split",
                "anchor_prefix",
                "root_relative",
                "storage_relative"
            ]
        );
    }
}
