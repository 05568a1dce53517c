use serde::{Deserialize, Serialize};

/// Comma-separated glob patterns naming entries to leave out of a comparison.
///
/// `*` matches any run of characters and `?` a single one. Matching ignores
/// case, like every other name comparison in a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameFilter {
    patterns: Vec<String>,
}

impl NameFilter {
    pub fn new(list: &str) -> Self {
        let patterns = list
            .split(',')
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn excludes(&self, name: &str) -> bool {
        let name: Vec<char> = name.to_lowercase().chars().collect();
        self.patterns.iter().any(|p| fnmatch(&p.chars().collect::<Vec<_>>(), &name))
    }

    /// Whether the last component of a `store:/path` is excluded.
    pub fn excludes_path(&self, path: &str) -> bool {
        path.rsplit('/').next().is_some_and(|name| !name.is_empty() && self.excludes(name))
    }
}

fn fnmatch(pat: &[char], name: &[char]) -> bool {
    let mut pi = 0;
    let mut ni = 0;
    let mut star_pi = usize::MAX;
    let mut star_ni = 0;

    while ni < name.len() {
        if pi < pat.len() && (pat[pi] == '?' || pat[pi] == name[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < pat.len() && pat[pi] == '*' {
            star_pi = pi;
            star_ni = ni;
            pi += 1;
        } else if star_pi != usize::MAX {
            pi = star_pi + 1;
            star_ni += 1;
            ni = star_ni;
        } else {
            return false;
        }
    }

    while pi < pat.len() && pat[pi] == '*' {
        pi += 1;
    }
    pi == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_ignore_case() {
        let filter = NameFilter::new("*.bak, Thumbs.db");
        assert!(filter.excludes("notes.BAK"));
        assert!(filter.excludes("thumbs.db"));
        assert!(!filter.excludes("notes.txt"));
    }

    #[test]
    fn test_question_mark_and_empty() {
        let filter = NameFilter::new("v?");
        assert!(filter.excludes("v1"));
        assert!(!filter.excludes("v10"));
        assert!(NameFilter::new(" , ").is_empty());
        assert!(!NameFilter::default().excludes("anything"));
    }

    #[test]
    fn test_question_mark_matches_one_character() {
        let filter = NameFilter::new("caf?");
        assert!(filter.excludes("café"));
        assert!(filter.excludes("CAFÉ"));
        assert!(!filter.excludes("cafés"));
        assert!(NameFilter::new("*é").excludes("Résumé"));
    }

    #[test]
    fn test_excludes_path_uses_last_component() {
        let filter = NameFilter::new("*.tmp");
        assert!(filter.excludes_path("main:/a/b.tmp"));
        assert!(!filter.excludes_path("main:/a.tmp/b"));
        assert!(!filter.excludes_path("main:/"));
    }
}
