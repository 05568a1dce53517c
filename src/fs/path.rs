use std::fmt;

use crate::fs::error::{AvmError, AvmResult};
use crate::types::VersionId;

const MAX_PATH_LENGTH: usize = 4096;
const MAX_NAME_LENGTH: usize = 255;

/// A parsed `store:/path[@version]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AvmPath {
    pub store: String,
    pub path: String,
    pub version: Option<VersionId>,
}

impl AvmPath {
    pub fn parse(raw: &str) -> AvmResult<Self> {
        let (store, rest) = raw
            .split_once(':')
            .ok_or_else(|| AvmError::BadArgument(format!("Missing store in path: {}", raw)))?;
        validate_store_name(store)?;

        let (path, version) = match rest.rsplit_once('@') {
            Some((path, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
                let version = suffix
                    .parse::<VersionId>()
                    .map_err(|_| AvmError::BadArgument(format!("Invalid version: {}", suffix)))?;
                (path, Some(version))
            }
            _ => (rest, None),
        };

        Ok(Self { store: store.to_string(), path: normalize_path(path)?, version })
    }

    pub fn new(store: &str, path: &str) -> AvmResult<Self> {
        validate_store_name(store)?;
        Ok(Self { store: store.to_string(), path: normalize_path(path)?, version: None })
    }

    pub fn root(store: &str) -> AvmResult<Self> {
        Self::new(store, "/")
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn components(&self) -> Vec<String> {
        components_of(&self.path)
    }

    pub fn join(&self, name: &str) -> AvmPath {
        AvmPath { store: self.store.clone(), path: join_path(&self.path, name), version: None }
    }

    pub fn parent_and_name(&self) -> AvmResult<(AvmPath, String)> {
        let (parent, name) = split_path(&self.path)?;
        Ok((AvmPath { store: self.store.clone(), path: parent, version: None }, name))
    }

    /// True when `self` is `other` or lies underneath it, ignoring case.
    pub fn is_within(&self, other: &AvmPath) -> bool {
        self.store.eq_ignore_ascii_case(&other.store) && path_is_within(&self.path, &other.path)
    }

    pub fn store_key(&self) -> String {
        self.store.to_lowercase()
    }
}

impl fmt::Display for AvmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store, self.path)
    }
}

pub fn validate_store_name(name: &str) -> AvmResult<()> {
    if name.is_empty() {
        return Err(AvmError::BadArgument("Empty store name".to_string()));
    }
    if name.chars().any(|c| matches!(c, ':' | '/' | '\\' | '@' | '\0')) {
        return Err(AvmError::BadArgument(format!("Illegal store name: {}", name)));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> AvmResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(AvmError::BadArgument(format!("Illegal name: '{}'", name)));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(AvmError::BadArgument(format!(
            "Name too long: {} bytes (max {})",
            name.len(),
            MAX_NAME_LENGTH
        )));
    }
    if name.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0')) {
        return Err(AvmError::BadArgument(format!("Illegal name: {}", name)));
    }
    Ok(())
}

pub fn normalize_path(path: &str) -> AvmResult<String> {
    if path.is_empty() {
        return Err(AvmError::BadArgument("Empty path".to_string()));
    }

    if path.contains('\0') {
        return Err(AvmError::BadArgument("Path contains NULL character".to_string()));
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(AvmError::BadArgument(format!("Path too long: {} bytes", path.len())));
    }

    if !path.starts_with('/') {
        return Err(AvmError::BadArgument(format!("Path must start with /: {}", path)));
    }

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for part in &parts {
        validate_name(part)?;
    }

    Ok(format!("/{}", parts.join("/")))
}

pub fn split_path(path: &str) -> AvmResult<(String, String)> {
    let normalized = normalize_path(path)?;

    if normalized == "/" {
        return Err(AvmError::BadArgument("Cannot split root path".to_string()));
    }

    match normalized.rsplit_once('/') {
        Some(("", name)) => Ok(("/".to_string(), name.to_string())),
        Some((parent, name)) => Ok((parent.to_string(), name.to_string())),
        None => Err(AvmError::BadArgument(format!("Invalid path: {}", path))),
    }
}

/// Components of an already normalized path.
pub fn components_of(path: &str) -> Vec<String> {
    path.split('/').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" { format!("/{}", name) } else { format!("{}/{}", dir, name) }
}

/// Case-insensitive "equal to or underneath" test on normalized paths.
pub fn path_is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    let path = path.to_lowercase();
    let ancestor = ancestor.to_lowercase();
    path == ancestor || path.starts_with(&format!("{}/", ancestor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_and_path() {
        let p = AvmPath::parse("main:/a/b").unwrap();
        assert_eq!(p.store, "main");
        assert_eq!(p.path, "/a/b");
        assert_eq!(p.version, None);
        assert_eq!(p.to_string(), "main:/a/b");
    }

    #[test]
    fn test_parse_version_suffix() {
        let p = AvmPath::parse("main:/a/foo@3").unwrap();
        assert_eq!(p.path, "/a/foo");
        assert_eq!(p.version, Some(3));
    }

    #[test]
    fn test_parse_at_sign_in_name_is_not_version() {
        let p = AvmPath::parse("main:/mail@host").unwrap();
        assert_eq!(p.path, "/mail@host");
        assert_eq!(p.version, None);
    }

    #[test]
    fn test_parse_missing_store() {
        assert!(matches!(AvmPath::parse("/a/b"), Err(AvmError::BadArgument(_))));
        assert!(matches!(AvmPath::parse(":/a"), Err(AvmError::BadArgument(_))));
    }

    #[test]
    fn test_normalize_path_trailing_and_double_slashes() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//data//files//").unwrap(), "/data/files");
    }

    #[test]
    fn test_normalize_path_rejects_relative_and_dots() {
        assert!(normalize_path("data").is_err());
        assert!(normalize_path("/a/../b").is_err());
        assert!(normalize_path("").is_err());
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/data").unwrap(), ("/".to_string(), "data".to_string()));
        assert_eq!(
            split_path("/data/files/test.txt").unwrap(),
            ("/data/files".to_string(), "test.txt".to_string())
        );
        assert!(split_path("/").is_err());
    }

    #[test]
    fn test_join_and_components() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(components_of("/a/b"), vec!["a", "b"]);
        assert!(components_of("/").is_empty());
    }

    #[test]
    fn test_is_within_ignores_case() {
        let a = AvmPath::parse("Main:/A").unwrap();
        let b = AvmPath::parse("main:/a/b").unwrap();
        let c = AvmPath::parse("main:/ab").unwrap();
        assert!(b.is_within(&a));
        assert!(a.is_within(&a));
        assert!(!c.is_within(&a));
        assert!(!a.is_within(&b));
        assert!(b.is_within(&AvmPath::root("main").unwrap()));
    }

    #[test]
    fn test_validate_names() {
        assert!(validate_name("foo.txt").is_ok());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_store_name("layer-1").is_ok());
        assert!(validate_store_name("bad:name").is_err());
    }
}
