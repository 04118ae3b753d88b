// SPDX-License-Identifier: MIT OR Apache-2.0

//! Language registry for tree-sitter parsers

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;
use tree_sitter::Language;

/// Supported languages with their tree-sitter parsers
pub struct LanguageRegistry {
    languages: HashMap<&'static str, Language>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageRegistry {
    pub fn new() -> Self {
        let mut languages = HashMap::new();

        languages.insert(
            "typescript",
            tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        );
        languages.insert("tsx", tree_sitter_typescript::LANGUAGE_TSX.into());
        languages.insert("javascript", tree_sitter_javascript::LANGUAGE.into());
        languages.insert("python", tree_sitter_python::LANGUAGE.into());
        languages.insert("rust", tree_sitter_rust::LANGUAGE.into());
        languages.insert("go", tree_sitter_go::LANGUAGE.into());
        languages.insert("c", tree_sitter_c::LANGUAGE.into());
        languages.insert("cpp", tree_sitter_cpp::LANGUAGE.into());
        languages.insert("java", tree_sitter_java::LANGUAGE.into());
        languages.insert("ruby", tree_sitter_ruby::LANGUAGE.into());

        Self { languages }
    }

    /// Get language by name
    pub fn get(&self, name: &str) -> Option<&Language> {
        self.languages.get(name.to_lowercase().as_str())
    }

    /// Whether syntax-aware chunking is available for `name`
    pub fn supports(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// List all supported languages
    pub fn supported_languages(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.languages.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Global language registry
pub static LANGUAGES: Lazy<LanguageRegistry> = Lazy::new(LanguageRegistry::new);

/// Map a file extension to a language name.
///
/// Languages without a registered grammar are still reported so callers can
/// classify the file as code; chunking then falls back to line boundaries.
pub fn detect_language(ext: &str) -> Option<&'static str> {
    match ext.to_lowercase().as_str() {
        "rs" => Some("rust"),
        "ts" => Some("typescript"),
        "tsx" => Some("tsx"),
        "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
        "py" => Some("python"),
        "go" => Some("go"),
        "java" => Some("java"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" => Some("cpp"),
        "rb" => Some("ruby"),
        "cs" => Some("csharp"),
        "php" => Some("php"),
        "swift" => Some("swift"),
        "kt" | "kts" => Some("kotlin"),
        "scala" => Some("scala"),
        "lua" => Some("lua"),
        "sh" | "bash" => Some("shell"),
        _ => None,
    }
}

/// Detect the language of a path (or path-like content id) from its extension.
pub fn language_for_path(path: impl AsRef<Path>) -> Option<&'static str> {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(detect_language)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        assert!(LANGUAGES.supports("Rust"));
        assert!(LANGUAGES.supports("tsx"));
        assert!(!LANGUAGES.supports("kotlin"));
        assert_eq!(LANGUAGES.supported_languages().len(), 10);
    }

    #[test]
    fn test_language_for_path() {
        assert_eq!(language_for_path("src/main.rs"), Some("rust"));
        assert_eq!(language_for_path("lib/app.TSX"), Some("tsx"));
        assert_eq!(language_for_path("notes/readme.md"), None);
        assert_eq!(language_for_path("Makefile"), None);
    }
}
