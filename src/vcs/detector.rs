//! Stale-write detection.

use super::FileVersion;

/// Outcome of comparing a commit's base against the stored head
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict<'a> {
    /// The commit may be appended
    Clear,
    /// Someone committed after the caller's base
    Stale(&'a FileVersion),
    /// The base refers to a version that does not exist yet
    Ahead { base: u64, latest: u64 },
}

/// Decides whether a commit based on `base_version` may land on `head`.
///
/// A base of 0 claims the path has no versions yet. It is clear on a new
/// path and stale against any existing head.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn check<'a>(&self, base_version: u64, head: Option<&'a FileVersion>) -> Verdict<'a> {
        let latest = head.map(|v| v.version).unwrap_or(0);

        if base_version == latest {
            return Verdict::Clear;
        }
        match head {
            Some(head) if head.version > base_version => Verdict::Stale(head),
            _ => Verdict::Ahead {
                base: base_version,
                latest,
            },
        }
    }
}
