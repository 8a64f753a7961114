use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How much of the file system below a watched path a watch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchScope {
    /// Only the path itself (a file or a directory entry).
    PathOnly,
    /// A directory and its direct entries.
    PathAndChildren,
    /// A directory and everything below it.
    PathAndAllDescendants,
}

impl WatchScope {
    /// Maximum depth a rescan walks for this scope; `None` means unbounded.
    pub fn max_depth(self) -> Option<usize> {
        match self {
            WatchScope::PathOnly | WatchScope::PathAndChildren => Some(1),
            WatchScope::PathAndAllDescendants => None,
        }
    }

    pub fn requires_directory(self) -> bool {
        !matches!(self, WatchScope::PathOnly)
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WatchScope::PathOnly => "path",
            WatchScope::PathAndChildren => "children",
            WatchScope::PathAndAllDescendants => "descendants",
        })
    }
}

impl FromStr for WatchScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" | "path_only" => Ok(WatchScope::PathOnly),
            "children" | "path_and_children" => Ok(WatchScope::PathAndChildren),
            "descendants" | "recursive" | "path_and_all_descendants" => {
                Ok(WatchScope::PathAndAllDescendants)
            }
            other => Err(format!("unknown watch scope {other:?}")),
        }
    }
}

/// How a watch approximates the events lost when the native layer overflows.
///
/// Every policy still delivers the [`crate::WatchEventKind::Overflow`] event itself to the
/// handler; the policy decides which synthetic events follow it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approximation {
    /// No synthetic events. The handler is responsible for recovery.
    None,
    /// Memoryless rescan: `Created` for every entry in scope, plus `Modified` for every
    /// non-empty regular file. Never reports deletions.
    #[default]
    All,
    /// Indexed rescan: compares against a last-modified index kept for the lifetime of the
    /// watch and reports only the differences, including deletions.
    Diff,
}

impl fmt::Display for Approximation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Approximation::None => "none",
            Approximation::All => "all",
            Approximation::Diff => "diff",
        })
    }
}

impl FromStr for Approximation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Approximation::None),
            "all" | "memoryless" => Ok(Approximation::All),
            "diff" | "indexed" => Ok(Approximation::Diff),
            other => Err(format!("unknown overflow approximation {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescan_depth_follows_scope() {
        assert_eq!(WatchScope::PathOnly.max_depth(), Some(1));
        assert_eq!(WatchScope::PathAndChildren.max_depth(), Some(1));
        assert_eq!(WatchScope::PathAndAllDescendants.max_depth(), None);
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!("Descendants".parse(), Ok(WatchScope::PathAndAllDescendants));
        assert_eq!("path".parse(), Ok(WatchScope::PathOnly));
        assert_eq!("indexed".parse(), Ok(Approximation::Diff));
        assert!("sideways".parse::<WatchScope>().is_err());
    }
}
