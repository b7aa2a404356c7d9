//! Path-scope helpers shared by the change journal and the CLI.
//!
//! Journal paths are stored as plain strings exactly as the scanner reported
//! them. Scope matching is component-wise: `/data` covers `/data` and
//! `/data/sub`, never `/database`.

/// Strip trailing separators, keeping a bare root (`/`, `C:\`) intact.
#[must_use]
pub fn normalize_scope(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        // Bare root, or the empty match-everything scope.
        return path.chars().next().map(String::from).unwrap_or_default();
    }
    if trimmed.ends_with(':') && trimmed.len() < path.len() {
        // Drive root such as `C:\`.
        return path[..=trimmed.len()].to_string();
    }
    trimmed.to_string()
}

/// Separator that a scope's children use.
#[must_use]
pub fn separator_for(path: &str) -> char {
    // A bare drive (`C:`) has no separator yet but takes `\`.
    if path.ends_with(':') || (path.contains('\\') && !path.contains('/')) {
        '\\'
    } else {
        '/'
    }
}

/// Prefix every descendant of `scope` starts with.
///
/// The empty scope yields the empty prefix, which matches every path.
#[must_use]
pub fn descendant_prefix(scope: &str) -> String {
    let scope = normalize_scope(scope);
    if scope.is_empty() || scope.ends_with(['/', '\\']) {
        return scope;
    }
    let mut prefix = scope.clone();
    prefix.push(separator_for(&scope));
    prefix
}

/// Whether `path` equals `scope` or lies beneath it.
#[must_use]
pub fn is_within_scope(path: &str, scope: &str) -> bool {
    let scope_norm = normalize_scope(scope);
    let path_norm = normalize_scope(path);
    path_norm == scope_norm || path_norm.starts_with(&descendant_prefix(&scope_norm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_separators() {
        assert_eq!(normalize_scope("/data/"), "/data");
        assert_eq!(normalize_scope("/data//"), "/data");
        assert_eq!(normalize_scope("C:\\Users\\"), "C:\\Users");
    }

    #[test]
    fn normalize_keeps_roots() {
        assert_eq!(normalize_scope("/"), "/");
        assert_eq!(normalize_scope(""), "");
        assert_eq!(normalize_scope("C:\\"), "C:\\");
    }

    #[test]
    fn descendant_prefix_appends_native_separator() {
        assert_eq!(descendant_prefix("/data"), "/data/");
        assert_eq!(descendant_prefix("/data/"), "/data/");
        assert_eq!(descendant_prefix("C:\\Users"), "C:\\Users\\");
        assert_eq!(descendant_prefix("C:"), "C:\\");
        assert_eq!(descendant_prefix("C:\\"), "C:\\");
        assert_eq!(descendant_prefix("/"), "/");
        assert_eq!(descendant_prefix(""), "");
    }

    #[test]
    fn scope_match_is_component_wise() {
        assert!(is_within_scope("/data", "/data"));
        assert!(is_within_scope("/data/sub/x", "/data"));
        assert!(is_within_scope("/data/sub", "/data/"));
        assert!(!is_within_scope("/database", "/data"));
        assert!(!is_within_scope("/", "/data"));
        assert!(is_within_scope("/anything", "/"));
        assert!(is_within_scope("/anything", ""));
    }

    #[test]
    fn bare_drive_scope_covers_its_tree() {
        assert!(is_within_scope("C:\\Users\\x", "C:"));
        assert!(is_within_scope("C:\\", "C:"));
        assert!(!is_within_scope("D:\\Users", "C:"));
    }
}
