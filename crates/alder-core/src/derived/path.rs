//! Minimal path-expression language.
//!
//! Grammar:
//!
//! ```text
//! expr := "size" "(" expr ")"
//!       | "closure" "(" ident ")"
//!       | "self" "." ident
//! ```
//!
//! `self.name` reads the attribute `name`, falling back to reference
//! navigation when the element has no such property. `closure(ref)` is the
//! set of elements transitively reachable over `ref`, excluding the start
//! element unless a cycle returns to it. `size(expr)` counts an element set
//! or a list value. Enough to express `size(closure(children))`; a
//! production query language plugs in through the same trait.

use std::collections::{BTreeSet, VecDeque};

use super::access::AccessRecordingReader;
use super::language::{Evaluated, ExpressionError, ExpressionLanguage};
use crate::graph::{NodeId, PropertyValue};

pub const PATH_LANGUAGE_ID: &str = "path";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Feature(String),
    Closure(String),
    Size(Box<Expr>),
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            position: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.rest().chars().next() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ExpressionError> {
        self.skip_ws();
        match self.rest().chars().next() {
            Some(c) if c == expected => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn ident(&mut self) -> Result<String, ExpressionError> {
        self.skip_ws();
        let rest = self.rest();
        let mut len = 0;
        for (i, c) in rest.char_indices() {
            let valid = if i == 0 {
                c.is_alphabetic() || c == '_'
            } else {
                c.is_alphanumeric() || c == '_'
            };
            if !valid {
                break;
            }
            len = i + c.len_utf8();
        }
        if len == 0 {
            return Err(self.error("expected identifier"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn parse_expr(&mut self) -> Result<Expr, ExpressionError> {
        let ident = self.ident()?;
        match ident.as_str() {
            "size" => {
                self.expect('(')?;
                let inner = self.parse_expr()?;
                self.expect(')')?;
                Ok(Expr::Size(Box::new(inner)))
            }
            "closure" => {
                self.expect('(')?;
                let reference = self.ident()?;
                self.expect(')')?;
                Ok(Expr::Closure(reference))
            }
            "self" => {
                self.expect('.')?;
                let feature = self.ident()?;
                Ok(Expr::Feature(feature))
            }
            other => Err(self.error(format!(
                "expected 'size', 'closure' or 'self', found '{}'",
                other
            ))),
        }
    }
}

fn parse(text: &str) -> Result<Expr, ExpressionError> {
    let mut parser = Parser { text, pos: 0 };
    let expr = parser.parse_expr()?;
    parser.skip_ws();
    if parser.pos != text.len() {
        return Err(parser.error("trailing input"));
    }
    Ok(expr)
}

fn eval(
    expr: &Expr,
    element: NodeId,
    reader: &AccessRecordingReader<'_>,
) -> Result<Evaluated, ExpressionError> {
    match expr {
        Expr::Feature(name) => {
            if let Some(value) = reader.attribute(element, name)? {
                Ok(Evaluated::Value(value))
            } else {
                Ok(Evaluated::Elements(reader.targets(element, name)?))
            }
        }
        Expr::Closure(reference) => {
            let mut seen = BTreeSet::new();
            let mut expanded = BTreeSet::new();
            let mut order = Vec::new();
            let mut queue = VecDeque::from([element]);
            while let Some(current) = queue.pop_front() {
                if !expanded.insert(current) {
                    continue;
                }
                for target in reader.targets(current, reference)? {
                    if seen.insert(target) {
                        order.push(target);
                        queue.push_back(target);
                    }
                }
            }
            Ok(Evaluated::Elements(order))
        }
        Expr::Size(inner) => match eval(inner, element, reader)? {
            Evaluated::Elements(nodes) => Ok(Evaluated::Value(PropertyValue::Int(nodes.len() as i64))),
            Evaluated::Value(PropertyValue::List(items)) => {
                Ok(Evaluated::Value(PropertyValue::Int(items.len() as i64)))
            }
            Evaluated::Value(other) => Err(ExpressionError::Eval(format!(
                "size() needs a collection, got '{}'",
                other.display()
            ))),
        },
    }
}

#[derive(Debug, Default)]
pub struct PathLanguage;

impl PathLanguage {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionLanguage for PathLanguage {
    fn id(&self) -> &str {
        PATH_LANGUAGE_ID
    }

    fn validate(&self, expression: &str) -> Result<(), ExpressionError> {
        parse(expression).map(|_| ())
    }

    fn evaluate(
        &self,
        expression: &str,
        element: NodeId,
        reader: &AccessRecordingReader<'_>,
    ) -> Result<Evaluated, ExpressionError> {
        let expr = parse(expression)?;
        eval(&expr, element, reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::access::ReadScope;
    use crate::derived::PROPERTY_DERIVED_FLAG;
    use crate::graph::{GraphBackend, MemoryGraph};
    use crate::sync::PROPERTY_CONTAINMENT;

    #[test]
    fn test_parse_accepts_the_grammar() {
        assert!(parse("self.label").is_ok());
        assert!(parse("closure(children)").is_ok());
        assert!(parse("size(closure(children))").is_ok());
        assert!(parse("  size ( closure ( children ) ) ").is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "self",
            "self.",
            "size()",
            "closure()",
            "closure(a.b)",
            "size(closure(children)) extra",
            "count(children)",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(matches!(err, ExpressionError::Parse { .. }), "{:?}", bad);
        }
    }

    #[test]
    fn test_parse_error_position() {
        match parse("size(closure(children)") {
            Err(ExpressionError::Parse { position, .. }) => {
                assert_eq!(position, "size(closure(children)".len());
            }
            other => panic!("expected parse error, got {:?}", other.is_ok()),
        }
    }

    fn chain(g: &MemoryGraph, n: usize) -> Vec<crate::graph::NodeId> {
        let nodes: Vec<_> = (0..n)
            .map(|i| {
                g.create_node(
                    &[("label".to_string(), format!("n{}", i).into())],
                    "element",
                )
                .unwrap()
            })
            .collect();
        for pair in nodes.windows(2) {
            g.create_relationship(
                pair[0],
                pair[1],
                "children",
                &[(PROPERTY_CONTAINMENT.to_string(), true.into())],
            )
            .unwrap();
        }
        nodes
    }

    #[test]
    fn test_eval_feature_and_size() {
        let g = MemoryGraph::new();
        let nodes = chain(&g, 3);
        let lang = PathLanguage::new();

        let reader = AccessRecordingReader::new(&g);
        assert_eq!(
            lang.evaluate("self.label", nodes[0], &reader).unwrap(),
            Evaluated::Value("n0".into())
        );
        assert_eq!(
            lang.evaluate("size(closure(children))", nodes[0], &reader)
                .unwrap(),
            Evaluated::Value(PropertyValue::Int(2))
        );
    }

    #[test]
    fn test_closure_records_every_expanded_element() {
        let g = MemoryGraph::new();
        let nodes = chain(&g, 3);
        let lang = PathLanguage::new();

        let reader = AccessRecordingReader::new(&g);
        let result = lang
            .evaluate("closure(children)", nodes[0], &reader)
            .unwrap();
        assert_eq!(result, Evaluated::Elements(vec![nodes[1], nodes[2]]));

        let accesses = reader.take_accesses();
        let recorded: Vec<_> = accesses
            .iter()
            .map(|a| (a.element, a.property.as_str()))
            .collect();
        // Every expanded node's 'children' read is a dependency.
        assert!(recorded.contains(&(nodes[0], "children")));
        assert!(recorded.contains(&(nodes[1], "children")));
        assert!(recorded.contains(&(nodes[2], "children")));
    }

    #[test]
    fn test_closure_follows_cycles_once() {
        let g = MemoryGraph::new();
        let a = g.create_node(&[], "element").unwrap();
        let b = g.create_node(&[], "element").unwrap();
        g.create_relationship(a, b, "next", &[]).unwrap();
        g.create_relationship(b, a, "next", &[]).unwrap();

        let reader = AccessRecordingReader::new(&g);
        let result = PathLanguage::new()
            .evaluate("closure(next)", a, &reader)
            .unwrap();
        // The cycle returns to the start, so it is included.
        assert_eq!(result, Evaluated::Elements(vec![b, a]));
    }

    #[test]
    fn test_derived_edges_are_not_navigable() {
        let g = MemoryGraph::new();
        let element = g.create_node(&[], "element").unwrap();
        let derived = g.create_node(&[], "derived").unwrap();
        g.create_relationship(
            element,
            derived,
            "children",
            &[(PROPERTY_DERIVED_FLAG.to_string(), true.into())],
        )
        .unwrap();

        let reader = AccessRecordingReader::new(&g);
        let result = PathLanguage::new()
            .evaluate("closure(children)", element, &reader)
            .unwrap();
        assert_eq!(result, Evaluated::Elements(vec![]));
    }

    #[test]
    fn test_subtree_scope_limits_navigation() {
        let g = MemoryGraph::new();
        let nodes = chain(&g, 4);

        // Scope to the subtree rooted at the second node.
        let reader = AccessRecordingReader::scoped(&g, ReadScope::Subtree(nodes[1]));
        let result = PathLanguage::new()
            .evaluate("closure(children)", nodes[1], &reader)
            .unwrap();
        assert_eq!(result, Evaluated::Elements(vec![nodes[2], nodes[3]]));

        // From the root, the first hop leaves nothing in scope except the
        // subtree itself.
        let reader = AccessRecordingReader::scoped(&g, ReadScope::Subtree(nodes[1]));
        let result = PathLanguage::new()
            .evaluate("closure(children)", nodes[0], &reader)
            .unwrap();
        assert_eq!(result, Evaluated::Elements(vec![nodes[1], nodes[2], nodes[3]]));
    }
}
