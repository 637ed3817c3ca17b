//! Snapshot exclusion rules.
//!
//! Patterns use the copy tool's vocabulary:
//! - `/proc` - anchored path, excluded with everything below it
//! - `/**/.cache/**` - contents of every directory with that name
//! - `lost+found` - any path component with that name
//!
//! Anchored patterns are written as host paths and rewritten relative to
//! the snapshot source root before use.

use std::path::{Component, Path, PathBuf};

/// Pseudo-filesystem and scratch mount points never copied.
pub const MANDATORY_EXCLUSIONS: &[&str] = &["/proc", "/sys", "/dev", "/run", "/tmp", "/mnt"];

/// Transient caches anywhere in the tree.
pub const CACHE_EXCLUSION: &str = "/**/.cache/**";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Anchored(PathBuf),
    ContentsOf(String),
    Name(String),
}

impl Pattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(name) = raw
            .strip_prefix("/**/")
            .and_then(|rest| rest.strip_suffix("/**"))
        {
            return Some(Self::ContentsOf(name.to_string()));
        }
        if raw.starts_with('/') {
            let trimmed = raw.trim_end_matches('/');
            let path = if trimmed.is_empty() { "/" } else { trimmed };
            return Some(Self::Anchored(PathBuf::from(path)));
        }
        Some(Self::Name(raw.trim_end_matches('/').to_string()))
    }

    /// `rel` is relative to the source root, e.g. `var/lib/x`.
    fn matches(&self, rel: &Path, source_root: &Path) -> bool {
        match self {
            Self::Anchored(abs) => match anchor(abs, source_root) {
                Some(anchored) => rel.starts_with(anchored),
                None => false,
            },
            Self::ContentsOf(name) => {
                let parts: Vec<_> = normal_components(rel).collect();
                // The directory itself survives; only what is below it goes.
                parts.len() > 1
                    && parts[..parts.len() - 1]
                        .iter()
                        .any(|c| c == name)
            }
            Self::Name(name) => normal_components(rel).any(|c| c == *name),
        }
    }

    fn to_tool_pattern(&self, source_root: &Path) -> Option<String> {
        match self {
            Self::Anchored(abs) => {
                let anchored = anchor(abs, source_root)?;
                Some(format!("/{}", anchored.display()))
            }
            Self::ContentsOf(name) => Some(format!("/**/{}/**", name)),
            Self::Name(name) => Some(name.clone()),
        }
    }
}

fn normal_components(path: &Path) -> impl Iterator<Item = String> + '_ {
    path.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Express a host path relative to `source_root`; `None` if it lies outside.
fn anchor<'a>(abs: &'a Path, source_root: &Path) -> Option<&'a Path> {
    abs.strip_prefix(source_root).ok()
}

/// Ordered, de-duplicated set of exclusion patterns.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    raw: Vec<String>,
    patterns: Vec<Pattern>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mandatory set for a build staging into `staging_dir`.
    pub fn for_staging(staging_dir: &Path) -> Self {
        let mut set = Self::new();
        for pattern in MANDATORY_EXCLUSIONS {
            set.push(pattern);
        }
        set.push(&staging_dir.to_string_lossy());
        set.push(CACHE_EXCLUSION);
        set
    }

    /// Append a pattern. Duplicates and blank patterns are ignored.
    pub fn push(&mut self, raw: &str) -> bool {
        let Some(pattern) = Pattern::parse(raw) else {
            return false;
        };
        if self.patterns.contains(&pattern) {
            return false;
        }
        self.raw.push(raw.trim().to_string());
        self.patterns.push(pattern);
        true
    }

    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in patterns {
            self.push(p.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Patterns as given, in insertion order.
    pub fn patterns(&self) -> &[String] {
        &self.raw
    }

    /// Whether `rel` (relative to `source_root`) must be skipped.
    pub fn is_excluded(&self, rel: &Path, source_root: &Path) -> bool {
        self.patterns.iter().any(|p| p.matches(rel, source_root))
    }

    /// Patterns in the copy tool's syntax, anchored to `source_root`.
    ///
    /// Anchored host paths outside the source root cannot match anything and
    /// are dropped.
    pub fn tool_patterns(&self, source_root: &Path) -> Vec<String> {
        self.patterns
            .iter()
            .filter_map(|p| p.to_tool_pattern(source_root))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mandatory_set_contents_and_order() {
        let set = ExclusionSet::for_staging(Path::new("/var/tmp/hostiso-staging-1"));
        assert_eq!(
            set.patterns(),
            [
                "/proc",
                "/sys",
                "/dev",
                "/run",
                "/tmp",
                "/mnt",
                "/var/tmp/hostiso-staging-1",
                "/**/.cache/**"
            ]
        );
    }

    #[test]
    fn test_duplicates_ignored() {
        let mut set = ExclusionSet::for_staging(Path::new("/var/tmp/s"));
        let before = set.len();
        assert!(!set.push("/proc"));
        assert!(!set.push("/proc/"));
        assert!(!set.push("  "));
        assert!(set.push("/home"));
        assert_eq!(set.len(), before + 1);
        assert_eq!(set.patterns().last().map(String::as_str), Some("/home"));
    }

    #[test]
    fn test_anchored_matching() {
        let set = ExclusionSet::for_staging(Path::new("/var/tmp/stage"));
        let root = Path::new("/");
        assert!(set.is_excluded(Path::new("proc"), root));
        assert!(set.is_excluded(Path::new("proc/1/status"), root));
        assert!(!set.is_excluded(Path::new("processes"), root));
        assert!(set.is_excluded(Path::new("var/tmp/stage/etc/passwd"), root));
        assert!(!set.is_excluded(Path::new("var/tmp/other"), root));
    }

    #[test]
    fn test_cache_contents_excluded_but_dir_kept() {
        let set = ExclusionSet::for_staging(Path::new("/var/tmp/stage"));
        let root = Path::new("/");
        assert!(!set.is_excluded(Path::new("home/ann/.cache"), root));
        assert!(set.is_excluded(Path::new("home/ann/.cache/thumbs/a.png"), root));
        assert!(!set.is_excluded(Path::new("home/ann/.cachefile"), root));
    }

    #[test]
    fn test_bare_names_match_anywhere() {
        let mut set = ExclusionSet::new();
        set.push("lost+found");
        let root = Path::new("/");
        assert!(set.is_excluded(Path::new("lost+found"), root));
        assert!(set.is_excluded(Path::new("srv/data/lost+found/x"), root));
        assert!(!set.is_excluded(Path::new("srv/data"), root));
    }

    #[test]
    fn test_patterns_rebased_on_source_root() {
        let src = Path::new("/srv/hostroot");
        let set = ExclusionSet::for_staging(Path::new("/srv/hostroot/var/stage"));

        assert!(set.is_excluded(Path::new("var/stage/boot"), src));
        let tool = set.tool_patterns(src);
        assert!(tool.contains(&"/var/stage".to_string()));
        assert!(tool.contains(&"/**/.cache/**".to_string()));
        // Pseudo-filesystems live outside this source root.
        assert!(!tool.iter().any(|p| p == "/proc"));
    }

    #[test]
    fn test_tool_patterns_for_live_root() {
        let set = ExclusionSet::for_staging(Path::new("/var/tmp/stage"));
        let tool = set.tool_patterns(Path::new("/"));
        assert_eq!(tool[0], "/proc");
        assert_eq!(tool[6], "/var/tmp/stage");
    }
}
