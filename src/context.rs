//! Context annotations: short human-written descriptions attached to a
//! virtual path prefix, shown alongside search results.
//!
//! Contexts live in `index.yml` next to the collections. Keys are virtual
//! paths: `/` (global), `collection`, or `collection/prefix`. Resolution is
//! most-specific-first: exact path, then each ancestor prefix, then the
//! collection, then global.

use std::collections::BTreeMap;

/// Normalize a user-supplied context key. `/` stays global; everything
/// else loses leading/trailing slashes.
pub fn normalize_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "/" || trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed.trim_matches('/').to_string()
}

/// Resolve the most specific context for a document.
pub fn resolve_context(
    contexts: &BTreeMap<String, String>,
    collection: &str,
    path: &str,
) -> Option<String> {
    if contexts.is_empty() {
        return None;
    }

    // Exact path, then ancestor prefixes.
    let mut candidate = format!("{collection}/{path}");
    loop {
        if let Some(text) = contexts.get(&candidate) {
            return Some(text.clone());
        }
        match candidate.rfind('/') {
            Some(idx) if idx > 0 => candidate.truncate(idx),
            _ => break,
        }
    }

    contexts.get("/").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contexts() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("/".to_string(), "global".to_string());
        map.insert("notes".to_string(), "all notes".to_string());
        map.insert("notes/recipes".to_string(), "cooking".to_string());
        map.insert(
            "notes/recipes/pasta.md".to_string(),
            "the pasta file".to_string(),
        );
        map
    }

    #[test]
    fn exact_path_wins() {
        let ctx = contexts();
        assert_eq!(
            resolve_context(&ctx, "notes", "recipes/pasta.md").as_deref(),
            Some("the pasta file")
        );
    }

    #[test]
    fn ancestor_prefix_applies() {
        let ctx = contexts();
        assert_eq!(
            resolve_context(&ctx, "notes", "recipes/soup.md").as_deref(),
            Some("cooking")
        );
        assert_eq!(
            resolve_context(&ctx, "notes", "journal/2026.md").as_deref(),
            Some("all notes")
        );
    }

    #[test]
    fn global_is_the_last_resort() {
        let ctx = contexts();
        assert_eq!(
            resolve_context(&ctx, "work", "todo.md").as_deref(),
            Some("global")
        );

        let mut no_global = ctx.clone();
        no_global.remove("/");
        assert_eq!(resolve_context(&no_global, "work", "todo.md"), None);
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_key("/"), "/");
        assert_eq!(normalize_key(""), "/");
        assert_eq!(normalize_key("/notes/recipes/"), "notes/recipes");
        assert_eq!(normalize_key("notes"), "notes");
    }
}
