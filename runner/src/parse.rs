//! Structural scans over generated test sources.
//!
//! Everything the engine knows about a test source it learns from a real
//! parse, never from string search: syntax validation happens before any
//! backend is invoked, and the classifier's assertion/attribute/import
//! scans walk the tree.

use crate::spec::Ecosystem;
use std::cell::RefCell;
use tree_sitter::{Node, Parser, Tree};

// Tree-sitter parsers are expensive to create but reusable; each thread
// keeps one pre-configured parser per grammar.
thread_local! {
    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - caught at parse time if the language fails
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });
}

fn parse(source: &str, ecosystem: Ecosystem) -> Option<Tree> {
    match ecosystem {
        Ecosystem::Django | Ecosystem::Flask => {
            PYTHON_PARSER.with(|p| p.borrow_mut().parse(source, None))
        }
        Ecosystem::Node => JS_PARSER.with(|p| p.borrow_mut().parse(source, None)),
    }
}

fn first_error_row(node: Node) -> Option<usize> {
    if node.is_error() || node.is_missing() {
        return Some(node.start_position().row);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(row) = first_error_row(child) {
            return Some(row);
        }
    }
    None
}

fn walk(node: Node, f: &mut impl FnMut(Node)) {
    f(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, f);
    }
}

/// Validate the test source without executing it
pub fn validate_syntax(source: &str, ecosystem: Ecosystem) -> Result<(), String> {
    let tree = parse(source, ecosystem)
        .ok_or_else(|| "Failed to parse generated test".to_string())?;

    let root = tree.root_node();
    if root.has_error() {
        let line = first_error_row(root).map(|row| row + 1).unwrap_or(1);
        return Err(format!("Syntax error in generated test at line {}", line));
    }

    Ok(())
}

/// First assertion in the test source: 1-based line number plus its text.
///
/// Python: the first `assert` statement. Node: the first `expect(...)` call.
pub fn first_assertion(source: &str, ecosystem: Ecosystem) -> Option<(usize, String)> {
    let tree = parse(source, ecosystem)?;
    let mut found: Option<usize> = None;

    walk(tree.root_node(), &mut |node| {
        if found.is_some() {
            return;
        }
        let hit = match ecosystem {
            Ecosystem::Django | Ecosystem::Flask => node.kind() == "assert_statement",
            Ecosystem::Node => {
                node.kind() == "call_expression"
                    && node
                        .child_by_field_name("function")
                        .is_some_and(|f| {
                            f.kind() == "identifier"
                                && f.utf8_text(source.as_bytes()) == Ok("expect")
                        })
            }
        };
        if hit {
            found = Some(node.start_position().row);
        }
    });

    let row = found?;
    let text = source.lines().nth(row)?.trim().to_string();
    Some((row + 1, text))
}

/// All attribute names referenced in the test source, in encounter order
pub fn attribute_references(source: &str, ecosystem: Ecosystem) -> Vec<String> {
    let Some(tree) = parse(source, ecosystem) else {
        return Vec::new();
    };

    let mut attributes = Vec::new();
    walk(tree.root_node(), &mut |node| {
        let attr = match ecosystem {
            Ecosystem::Django | Ecosystem::Flask => (node.kind() == "attribute")
                .then(|| node.child_by_field_name("attribute"))
                .flatten(),
            Ecosystem::Node => (node.kind() == "member_expression")
                .then(|| node.child_by_field_name("property"))
                .flatten(),
        };
        if let Some(name) = attr.and_then(|n| n.utf8_text(source.as_bytes()).ok()) {
            if !attributes.iter().any(|a| a == name) {
                attributes.push(name.to_string());
            }
        }
    });

    attributes
}

fn module_root(module: &str) -> Option<String> {
    let module = module.trim();
    if module.is_empty() || module.starts_with('.') {
        return None;
    }
    if let Some(rest) = module.strip_prefix('@') {
        // Scoped npm package: the root is @scope/name
        let mut parts = rest.splitn(3, '/');
        let scope = parts.next()?;
        let name = parts.next()?;
        return Some(format!("@{}/{}", scope, name));
    }
    let root = module
        .split(['.', '/'])
        .next()
        .filter(|s| !s.is_empty())?;
    Some(root.to_string())
}

fn string_literal_text<'a>(node: Node, source: &'a str) -> Option<&'a str> {
    if node.kind() != "string" {
        return None;
    }
    let text = node.utf8_text(source.as_bytes()).ok()?;
    Some(text.trim_matches(|c| c == '"' || c == '\'' || c == '`'))
}

/// Root module names the test source imports, in encounter order
pub fn imported_modules(source: &str, ecosystem: Ecosystem) -> Vec<String> {
    let Some(tree) = parse(source, ecosystem) else {
        return Vec::new();
    };

    let mut modules = Vec::new();
    let mut push = |name: Option<String>| {
        if let Some(name) = name {
            if !modules.iter().any(|m| m == &name) {
                modules.push(name);
            }
        }
    };

    walk(tree.root_node(), &mut |node| match ecosystem {
        Ecosystem::Django | Ecosystem::Flask => match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                for child in node.children(&mut cursor) {
                    if child.kind() == "dotted_name" || child.kind() == "aliased_import" {
                        let name_node = if child.kind() == "aliased_import" {
                            child.child_by_field_name("name")
                        } else {
                            Some(child)
                        };
                        push(
                            name_node
                                .and_then(|n| n.utf8_text(source.as_bytes()).ok())
                                .and_then(module_root),
                        );
                    }
                }
            }
            "import_from_statement" => {
                push(
                    node.child_by_field_name("module_name")
                        .and_then(|n| n.utf8_text(source.as_bytes()).ok())
                        .and_then(module_root),
                );
            }
            _ => {}
        },
        Ecosystem::Node => match node.kind() {
            "call_expression" => {
                let is_require = node
                    .child_by_field_name("function")
                    .is_some_and(|f| {
                        f.kind() == "identifier"
                            && f.utf8_text(source.as_bytes()) == Ok("require")
                    });
                if is_require {
                    let arg = node
                        .child_by_field_name("arguments")
                        .and_then(|args| args.named_child(0));
                    push(
                        arg.and_then(|a| string_literal_text(a, source))
                            .and_then(module_root),
                    );
                }
            }
            "import_statement" => {
                push(
                    node.child_by_field_name("source")
                        .and_then(|s| string_literal_text(s, source))
                        .and_then(module_root),
                );
            }
            _ => {}
        },
    });

    modules
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY_TEST: &str = r#"
import pytest
from myapp.models import Widget

def test_widget_label():
    widget = Widget(label="spanner")
    assert widget.label == "spanner"
    assert widget.slug is not None
"#;

    const JS_TEST: &str = r#"
const request = require('supertest');
const { app } = require('../src/server');

test('health endpoint', async () => {
  const res = await request(app).get('/health');
  expect(res.statusCode).toBe(200);
});
"#;

    #[test]
    fn test_validate_syntax_accepts_valid_python() {
        assert!(validate_syntax(PY_TEST, Ecosystem::Django).is_ok());
    }

    #[test]
    fn test_validate_syntax_rejects_broken_python() {
        let err = validate_syntax("def test_broken(:\n    pass\n", Ecosystem::Flask).unwrap_err();
        assert!(err.contains("Syntax error"));
    }

    #[test]
    fn test_validate_syntax_accepts_valid_js() {
        assert!(validate_syntax(JS_TEST, Ecosystem::Node).is_ok());
    }

    #[test]
    fn test_validate_syntax_rejects_broken_js() {
        let err = validate_syntax("test('x', async ( => {});", Ecosystem::Node).unwrap_err();
        assert!(err.contains("Syntax error"));
    }

    #[test]
    fn test_first_assertion_python() {
        let (line, text) = first_assertion(PY_TEST, Ecosystem::Django).unwrap();
        assert_eq!(line, 7);
        assert_eq!(text, r#"assert widget.label == "spanner""#);
    }

    #[test]
    fn test_first_assertion_js() {
        let (line, text) = first_assertion(JS_TEST, Ecosystem::Node).unwrap();
        assert_eq!(line, 7);
        assert!(text.starts_with("expect(res.statusCode)"));
    }

    #[test]
    fn test_first_assertion_absent() {
        assert!(first_assertion("x = 1\n", Ecosystem::Flask).is_none());
    }

    #[test]
    fn test_attribute_references_python() {
        let attrs = attribute_references(PY_TEST, Ecosystem::Django);
        assert!(attrs.contains(&"label".to_string()));
        assert!(attrs.contains(&"slug".to_string()));
    }

    #[test]
    fn test_attribute_references_js() {
        let attrs = attribute_references(JS_TEST, Ecosystem::Node);
        assert!(attrs.contains(&"statusCode".to_string()));
    }

    #[test]
    fn test_imported_modules_python() {
        let modules = imported_modules(PY_TEST, Ecosystem::Django);
        assert_eq!(modules, vec!["pytest".to_string(), "myapp".to_string()]);
    }

    #[test]
    fn test_imported_modules_js() {
        let modules = imported_modules(JS_TEST, Ecosystem::Node);
        assert!(modules.contains(&"supertest".to_string()));
        // Relative requires are not module dependencies.
        assert!(!modules.iter().any(|m| m.contains("server")));
    }

    #[test]
    fn test_module_root() {
        assert_eq!(module_root("django.test"), Some("django".to_string()));
        assert_eq!(module_root("@scope/pkg/sub"), Some("@scope/pkg".to_string()));
        assert_eq!(module_root("./local"), None);
    }
}
