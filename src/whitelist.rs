//! Symbolic-link allow rules.
//!
//! The service account can read anything it is pointed at, so symlinks inside
//! registered trees are only honored when their target lands under an
//! explicitly whitelisted directory and the link's owner is permitted for
//! that directory.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::load::username_for_uid;

#[derive(Debug, Clone)]
struct Rule {
    prefix: PathBuf,
    // None permits any owning user.
    users: Option<HashSet<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct LinkWhitelist {
    rules: Vec<Rule>,
}

impl LinkWhitelist {
    /// An empty whitelist: no symlink is ever followed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a JSON file mapping absolute directory prefixes to
    /// either `null` (any user) or an array of allowed usernames.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read whitelist file {}", path.display()))?;
        let parsed: HashMap<String, Option<Vec<String>>> = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse whitelist file {}", path.display()))?;

        let mut rules = Vec::with_capacity(parsed.len());
        for (prefix, users) in parsed {
            if !Path::new(&prefix).is_absolute() {
                anyhow::bail!("whitelist directory {:?} is not an absolute path", prefix);
            }
            rules.push(Rule {
                prefix: PathBuf::from(prefix),
                users: users.map(|list| list.into_iter().collect()),
            });
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a link owned by `user` resolving to `target` may be followed.
    pub fn allows(&self, target: &Path, user: &str) -> bool {
        self.rules.iter().any(|rule| {
            target.starts_with(&rule.prefix)
                && rule.users.as_ref().is_none_or(|set| set.contains(user))
        })
    }

    /// Whether the symlink at `link` may be followed, resolving its target and
    /// attributing it to the link's own (lstat) owner.
    pub fn allows_link(&self, link: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let Ok(target) = std::fs::canonicalize(link) else {
            return false;
        };
        let Ok(meta) = std::fs::symlink_metadata(link) else {
            return false;
        };
        let Some(user) = username_for_uid(meta.uid()) else {
            return false;
        };
        self.allows(&target, &user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist(rules: Vec<(&str, Option<Vec<&str>>)>) -> LinkWhitelist {
        LinkWhitelist {
            rules: rules
                .into_iter()
                .map(|(prefix, users)| Rule {
                    prefix: PathBuf::from(prefix),
                    users: users.map(|list| list.into_iter().map(String::from).collect()),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_whitelist_allows_nothing() {
        let wl = LinkWhitelist::new();
        assert!(!wl.allows(Path::new("/shared/data"), "alice"));
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let wl = whitelist(vec![("/shared/data", None)]);
        assert!(wl.allows(Path::new("/shared/data/run1/metadata.json"), "alice"));
        assert!(wl.allows(Path::new("/shared/data"), "alice"));
        assert!(!wl.allows(Path::new("/shared/database"), "alice"));
        assert!(!wl.allows(Path::new("/other"), "alice"));
    }

    #[test]
    fn user_restriction_applies() {
        let wl = whitelist(vec![("/shared/data", Some(vec!["alice", "bob"]))]);
        assert!(wl.allows(Path::new("/shared/data/x"), "alice"));
        assert!(wl.allows(Path::new("/shared/data/x"), "bob"));
        assert!(!wl.allows(Path::new("/shared/data/x"), "mallory"));
    }

    #[test]
    fn first_matching_rule_wins_across_rules() {
        let wl = whitelist(vec![
            ("/a", Some(vec!["alice"])),
            ("/a/open", None),
        ]);
        // The unrestricted rule still admits other users under its prefix.
        assert!(wl.allows(Path::new("/a/open/file"), "mallory"));
        assert!(!wl.allows(Path::new("/a/closed/file"), "mallory"));
    }

    #[test]
    fn load_rejects_relative_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("whitelist.json");
        std::fs::write(&file, br#"{"relative/dir": null}"#).unwrap();
        assert!(LinkWhitelist::load(&file).is_err());
    }

    #[test]
    fn load_parses_rules() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("whitelist.json");
        std::fs::write(&file, br#"{"/shared": ["alice"], "/open": null}"#).unwrap();
        let wl = LinkWhitelist::load(&file).unwrap();
        assert!(wl.allows(Path::new("/shared/x"), "alice"));
        assert!(!wl.allows(Path::new("/shared/x"), "bob"));
        assert!(wl.allows(Path::new("/open/x"), "bob"));
    }
}
