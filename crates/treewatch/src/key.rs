use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of one physical native registration: the watched directory and whether the
/// backend was asked to recurse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    path: PathBuf,
    recursive: bool,
}

impl SubscriptionKey {
    pub fn new(path: impl Into<PathBuf>, recursive: bool) -> Self {
        Self {
            path: path.into(),
            recursive,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if self.recursive {
            f.write_str("[recursive]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn recursion_is_part_of_identity() {
        let mut keys = HashSet::new();
        keys.insert(SubscriptionKey::new("/w", false));
        keys.insert(SubscriptionKey::new("/w", true));
        keys.insert(SubscriptionKey::new("/w", false));
        assert_eq!(keys.len(), 2);
        assert_eq!(SubscriptionKey::new("/w", true).to_string(), "/w[recursive]");
    }
}
