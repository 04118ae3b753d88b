// SPDX-License-Identifier: MIT OR Apache-2.0

//! Syntactic units extracted from a tree-sitter parse.
//!
//! A unit is a byte range of the source. The top-level units returned by
//! [`SyntaxSplitter::split`] tile the whole source, and each unit's children
//! tile the unit itself, so any mix of units and children is a gap-free
//! partition of the input. Whitespace and comments between nodes are
//! attached to the node that follows them.

use std::ops::Range;

use thiserror::Error;
use tree_sitter::{Node, Parser};

use crate::parser::languages::LANGUAGES;

/// Nesting depth explored below the top level.
pub const MAX_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum SyntaxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("grammar could not be loaded: {0}")]
    Language(#[from] tree_sitter::LanguageError),
    #[error("source does not parse cleanly")]
    ParseFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxUnit {
    pub range: Range<usize>,
    /// Function, class, impl and similar declarations.
    pub is_definition: bool,
    pub children: Vec<SyntaxUnit>,
}

/// Splits source code into nested syntactic units.
pub struct SyntaxSplitter {
    max_depth: usize,
}

impl Default for SyntaxSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntaxSplitter {
    pub fn new() -> Self {
        Self {
            max_depth: MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parse `source` and return its top-level units.
    ///
    /// Fails for languages without a grammar and for sources containing
    /// syntax errors, so callers can fall back to line boundaries. Returns an
    /// empty list when the tree has no named nodes.
    pub fn split(&self, source: &str, language: &str) -> Result<Vec<SyntaxUnit>, SyntaxError> {
        let lang = LANGUAGES
            .get(language)
            .ok_or_else(|| SyntaxError::UnsupportedLanguage(language.to_string()))?;

        let mut parser = Parser::new();
        parser.set_language(lang)?;

        let tree = parser
            .parse(source, None)
            .ok_or(SyntaxError::ParseFailed)?;
        let root = tree.root_node();
        if root.has_error() {
            return Err(SyntaxError::ParseFailed);
        }

        let lang = language.to_lowercase();
        Ok(self.tile(root, 0..source.len(), &lang, 0))
    }

    /// Tile `range` using the named children of `node` as cut points.
    fn tile(&self, node: Node, range: Range<usize>, lang: &str, depth: usize) -> Vec<SyntaxUnit> {
        let mut cursor = node.walk();
        let children: Vec<Node> = node
            .named_children(&mut cursor)
            .filter(|child| child.end_byte() > range.start && child.start_byte() < range.end)
            .collect();

        let mut cuts: Vec<(Node, Range<usize>)> = Vec::with_capacity(children.len());
        let mut start = range.start;
        for (idx, child) in children.iter().enumerate() {
            let is_last = idx + 1 == children.len();
            // comments stay glued to the item they describe
            if child.kind().contains("comment") && !is_last {
                continue;
            }
            let end = child.end_byte().min(range.end);
            if end <= start {
                continue;
            }
            cuts.push((*child, start..end));
            start = end;
        }

        if cuts.is_empty() {
            return Vec::new();
        }
        if start < range.end {
            if let Some(last) = cuts.last_mut() {
                last.1.end = range.end;
            }
        }

        cuts.into_iter()
            .map(|(child, span)| {
                let children = if depth < self.max_depth {
                    self.tile(child, span.clone(), lang, depth + 1)
                } else {
                    Vec::new()
                };
                SyntaxUnit {
                    range: span,
                    is_definition: is_definition(lang, child.kind()),
                    children,
                }
            })
            .collect()
    }
}

/// Node kinds that start a logical section, per language
fn is_definition(lang: &str, kind: &str) -> bool {
    match lang {
        "typescript" | "tsx" | "javascript" => matches!(
            kind,
            "function_declaration"
                | "generator_function_declaration"
                | "class_declaration"
                | "interface_declaration"
                | "type_alias_declaration"
                | "enum_declaration"
                | "method_definition"
                | "export_statement"
                | "lexical_declaration"
        ),
        "python" => matches!(
            kind,
            "function_definition" | "class_definition" | "decorated_definition"
        ),
        "rust" => matches!(
            kind,
            "function_item"
                | "struct_item"
                | "enum_item"
                | "trait_item"
                | "impl_item"
                | "type_item"
                | "mod_item"
                | "macro_definition"
        ),
        "go" => matches!(
            kind,
            "function_declaration" | "method_declaration" | "type_declaration"
        ),
        "c" => matches!(
            kind,
            "function_definition" | "struct_specifier" | "enum_specifier" | "type_definition"
        ),
        "cpp" => matches!(
            kind,
            "function_definition"
                | "class_specifier"
                | "struct_specifier"
                | "enum_specifier"
                | "namespace_definition"
                | "template_declaration"
                | "type_definition"
        ),
        "java" => matches!(
            kind,
            "method_declaration"
                | "class_declaration"
                | "interface_declaration"
                | "enum_declaration"
                | "constructor_declaration"
                | "record_declaration"
        ),
        "ruby" => matches!(kind, "method" | "singleton_method" | "class" | "module"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(units: &[SyntaxUnit], range: Range<usize>) {
        assert!(!units.is_empty());
        assert_eq!(units[0].range.start, range.start);
        assert_eq!(units[units.len() - 1].range.end, range.end);
        for pair in units.windows(2) {
            assert_eq!(pair[0].range.end, pair[1].range.start);
        }
        for unit in units {
            if !unit.children.is_empty() {
                assert_tiles(&unit.children, unit.range.clone());
            }
        }
    }

    #[test]
    fn test_rust_functions_tile_source() {
        let source = r#"
/// Adds numbers.
fn add(a: i32, b: i32) -> i32 {
    a + b
}

struct Point {
    x: i32,
}

fn main() {
    println!("{}", add(1, 2));
}
"#;
        let units = SyntaxSplitter::new().split(source, "rust").unwrap();
        assert_tiles(&units, 0..source.len());
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| u.is_definition));
        // the doc comment travels with the function it documents
        assert!(source[units[0].range.clone()].contains("/// Adds numbers."));
        assert!(source[units[0].range.clone()].contains("fn add"));
    }

    #[test]
    fn test_python_nested_units() {
        let source = "class Calc:\n    def add(self, a, b):\n        return a + b\n\n    def sub(self, a, b):\n        return a - b\n";
        let units = SyntaxSplitter::new().split(source, "python").unwrap();
        assert_tiles(&units, 0..source.len());
        assert_eq!(units.len(), 1);
        assert!(units[0].is_definition);
        assert!(!units[0].children.is_empty());
    }

    #[test]
    fn test_unsupported_language() {
        let result = SyntaxSplitter::new().split("code", "cobol");
        assert!(matches!(result, Err(SyntaxError::UnsupportedLanguage(_))));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let result = SyntaxSplitter::new().split("fn broken( {\n", "rust");
        assert!(matches!(result, Err(SyntaxError::ParseFailed)));
    }

    #[test]
    fn test_depth_limit() {
        let source = "fn a() { if true { loop { break; } } }\n";
        let units = SyntaxSplitter::new()
            .with_max_depth(0)
            .split(source, "rust")
            .unwrap();
        assert!(units.iter().all(|u| u.children.is_empty()));
    }
}
