//! Channel calculation engine.
//!
//! Derived measurements are configured as arithmetic expressions over channel
//! tags, e.g. `"P": "(A - B) * B / 47"`. The text is parsed with `evalexpr`
//! and the resulting operator tree is compiled into a closed arithmetic form:
//! numeric literals, identifiers, `+ - * / ^`, unary minus and parentheses.
//! Anything else `evalexpr` would accept (assignments, comparisons, function
//! calls, strings, tuples) is rejected at parse time. Channel tags are bound
//! as identifiers; no textual substitution takes place, so a tag such as `A`
//! cannot corrupt a neighbouring tag `AB`.
//!
//! All arithmetic is `f64`; integer literals are widened, so `1 / 2` is `0.5`.
//!
//! Two evaluation paths exist:
//!
//! - [`evaluate`] / [`Expression::evaluate`] look tags up in a map. This is the
//!   general contract and is used by tooling and tests.
//! - [`Expression::bind`] resolves every identifier to a channel position once,
//!   yielding a [`BoundExpression`] that evaluates directly over one scan of
//!   interleaved samples. The batch processor uses this form.
//!
//! Evaluation is pure: the same expression and values always produce the same
//! result.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use sentinel::calc::evaluate;
//!
//! let values = HashMap::from([("A".to_string(), 1.5), ("B".to_string(), 0.5)]);
//! assert_eq!(evaluate("(A + B) ^ 2", &values).unwrap(), 4.0);
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use evalexpr::{Operator, Value};
use thiserror::Error;

/// Errors raised while parsing or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalcError {
    /// The expression references a tag with no value.
    #[error("Unknown channel tag '{0}'")]
    UnknownChannelTag(String),

    /// The expression text is not valid under the arithmetic grammar.
    #[error("Invalid expression '{expression}': {reason}")]
    InvalidExpression {
        /// Offending expression text
        expression: String,
        /// What went wrong
        reason: String,
    },

    /// Evaluation produced NaN or an infinity (e.g. division by zero).
    #[error("Expression '{expression}' produced a non-finite value")]
    NonFiniteResult {
        /// Offending expression text
        expression: String,
    },
}

impl CalcError {
    fn invalid(expression: &str, reason: impl Into<String>) -> Self {
        CalcError::InvalidExpression {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
            BinaryOp::Pow => lhs.powf(rhs),
        }
    }
}

/// Arithmetic tree with leaves of type `L`: tag names before binding,
/// scan positions after.
#[derive(Debug, Clone, PartialEq)]
enum Node<L> {
    Number(f64),
    Leaf(L),
    Neg(Box<Node<L>>),
    Binary(BinaryOp, Box<Node<L>>, Box<Node<L>>),
}

impl<L> Node<L> {
    fn leaves<'a>(&'a self, out: &mut Vec<&'a L>) {
        match self {
            Node::Number(_) => {}
            Node::Leaf(leaf) => out.push(leaf),
            Node::Neg(inner) => inner.leaves(out),
            Node::Binary(_, lhs, rhs) => {
                lhs.leaves(out);
                rhs.leaves(out);
            }
        }
    }

    fn map_leaves<M, E>(&self, f: &impl Fn(&L) -> Result<M, E>) -> Result<Node<M>, E> {
        Ok(match self {
            Node::Number(value) => Node::Number(*value),
            Node::Leaf(leaf) => Node::Leaf(f(leaf)?),
            Node::Neg(inner) => Node::Neg(Box::new(inner.map_leaves(f)?)),
            Node::Binary(op, lhs, rhs) => Node::Binary(
                *op,
                Box::new(lhs.map_leaves(f)?),
                Box::new(rhs.map_leaves(f)?),
            ),
        })
    }

    fn eval(&self, lookup: &impl Fn(&L) -> Result<f64, CalcError>) -> Result<f64, CalcError> {
        Ok(match self {
            Node::Number(value) => *value,
            Node::Leaf(leaf) => lookup(leaf)?,
            Node::Neg(inner) => -inner.eval(lookup)?,
            Node::Binary(op, lhs, rhs) => op.apply(lhs.eval(lookup)?, rhs.eval(lookup)?),
        })
    }
}

/// Translate an `evalexpr` operator tree, rejecting non-arithmetic nodes.
fn compile(source: &str, node: &evalexpr::Node) -> Result<Node<String>, CalcError> {
    let children = node.children();
    let binary = |op: BinaryOp| -> Result<Node<String>, CalcError> {
        match children {
            [lhs, rhs] => Ok(Node::Binary(
                op,
                Box::new(compile(source, lhs)?),
                Box::new(compile(source, rhs)?),
            )),
            _ => Err(CalcError::invalid(source, "operator is missing an operand")),
        }
    };

    match node.operator() {
        // Whole expression or a parenthesized group.
        Operator::RootNode => match children {
            [inner] => compile(source, inner),
            [] => Err(CalcError::invalid(source, "empty expression")),
            _ => Err(CalcError::invalid(source, "unexpected trailing input")),
        },
        Operator::Add => binary(BinaryOp::Add),
        Operator::Sub => binary(BinaryOp::Sub),
        Operator::Mul => binary(BinaryOp::Mul),
        Operator::Div => binary(BinaryOp::Div),
        Operator::Exp => binary(BinaryOp::Pow),
        Operator::Neg => match children {
            [inner] => Ok(Node::Neg(Box::new(compile(source, inner)?))),
            _ => Err(CalcError::invalid(source, "'-' is missing an operand")),
        },
        Operator::Const { value } => match value {
            Value::Float(value) => Ok(Node::Number(*value)),
            Value::Int(value) => Ok(Node::Number(*value as f64)),
            other => Err(CalcError::invalid(
                source,
                format!("'{other}' is not a number"),
            )),
        },
        Operator::VariableIdentifierRead { identifier } => Ok(Node::Leaf(identifier.clone())),
        Operator::FunctionIdentifier { identifier } => Err(CalcError::invalid(
            source,
            format!("function calls are not supported ('{identifier}')"),
        )),
        other => Err(CalcError::invalid(
            source,
            format!("operator '{other}' is not supported"),
        )),
    }
}

/// A parsed expression, independent of any channel layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node<String>,
}

impl Expression {
    /// Parse `source` into an arithmetic tree.
    pub fn parse(source: &str) -> Result<Self, CalcError> {
        let tree = evalexpr::build_operator_tree(source)
            .map_err(|e| CalcError::invalid(source, e.to_string()))?;
        Ok(Self {
            source: source.to_string(),
            root: compile(source, &tree)?,
        })
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every identifier the expression references, sorted and deduplicated.
    pub fn identifiers(&self) -> BTreeSet<&str> {
        let mut leaves = Vec::new();
        self.root.leaves(&mut leaves);
        leaves.into_iter().map(String::as_str).collect()
    }

    /// Evaluate with identifiers looked up in `values`.
    ///
    /// Entries of `values` that the expression does not reference are ignored.
    pub fn evaluate(&self, values: &HashMap<String, f64>) -> Result<f64, CalcError> {
        let value = self.root.eval(&|name: &String| {
            values
                .get(name)
                .copied()
                .ok_or_else(|| CalcError::UnknownChannelTag(name.clone()))
        })?;
        finite(&self.source, value)
    }

    /// Resolve identifiers against an ordered list of channel tags.
    ///
    /// Fails with [`CalcError::UnknownChannelTag`] if the expression references
    /// a tag that is not in `tags`.
    pub fn bind<S: AsRef<str>>(&self, tags: &[S]) -> Result<BoundExpression, CalcError> {
        let root = self.root.map_leaves(&|name: &String| {
            tags.iter()
                .position(|tag| tag.as_ref() == name)
                .map(|index| (index, name.clone()))
                .ok_or_else(|| CalcError::UnknownChannelTag(name.clone()))
        })?;
        Ok(BoundExpression {
            source: self.source.clone(),
            root,
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// An expression whose identifiers refer to positions within one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundExpression {
    source: String,
    root: Node<(usize, String)>,
}

impl BoundExpression {
    /// Evaluate over the channel values of a single scan, in bind order.
    pub fn evaluate(&self, scan: &[f64]) -> Result<f64, CalcError> {
        let value = self.root.eval(&|(index, tag): &(usize, String)| {
            scan.get(*index)
                .copied()
                .ok_or_else(|| CalcError::UnknownChannelTag(tag.clone()))
        })?;
        finite(&self.source, value)
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn finite(source: &str, value: f64) -> Result<f64, CalcError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalcError::NonFiniteResult {
            expression: source.to_string(),
        })
    }
}

/// Evaluate `expression` with channel tags bound to `values`.
///
/// Parses on every call; prefer [`Expression::parse`] plus
/// [`Expression::bind`] on hot paths.
pub fn evaluate(expression: &str, values: &HashMap<String, f64>) -> Result<f64, CalcError> {
    Expression::parse(expression)?.evaluate(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn values(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn evaluates_precedence_and_grouping() {
        let v = values(&[("A", 3.0), ("B", 4.0)]);
        assert_eq!(evaluate("A + B * 2", &v).unwrap(), 11.0);
        assert_eq!(evaluate("(A + B) * 2", &v).unwrap(), 14.0);
        assert_eq!(evaluate("A - -B", &v).unwrap(), 7.0);
        assert_eq!(evaluate("-A + B", &v).unwrap(), 1.0);
        assert_eq!(evaluate("A ^ 2", &v).unwrap(), 9.0);
        assert_eq!(evaluate("-2 ^ 2", &v).unwrap(), -4.0);
    }

    #[test]
    fn integer_literals_divide_as_floats() {
        let v = values(&[]);
        assert_eq!(evaluate("1 / 2", &v).unwrap(), 0.5);
        assert_eq!(evaluate("7 / 2 * 2", &v).unwrap(), 7.0);
    }

    #[test]
    fn unknown_tag_is_reported() {
        let v = values(&[("A", 1.0)]);
        assert_eq!(
            evaluate("A + C", &v).unwrap_err(),
            CalcError::UnknownChannelTag("C".into())
        );
    }

    #[test]
    fn malformed_expression_is_reported() {
        let v = values(&[("A", 1.0)]);
        assert!(matches!(
            evaluate("A + (2", &v),
            Err(CalcError::InvalidExpression { .. })
        ));
        assert!(matches!(
            evaluate("", &v),
            Err(CalcError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn non_arithmetic_constructs_are_rejected() {
        for source in ["A = 2", "A > 1", "max(A, 2)", "\"volts\"", "A, A", "true"] {
            assert!(
                matches!(
                    Expression::parse(source),
                    Err(CalcError::InvalidExpression { .. })
                ),
                "{source} should be rejected"
            );
        }
    }

    #[test]
    fn division_by_zero_is_non_finite() {
        let v = values(&[("A", 1.0), ("B", 0.0)]);
        assert!(matches!(
            evaluate("A / B", &v),
            Err(CalcError::NonFiniteResult { .. })
        ));
    }

    #[test]
    fn unused_tags_are_ignored() {
        let v = values(&[("A", 1.0), ("B", 2.0), ("Unused", 99.0)]);
        assert_eq!(evaluate("A + B", &v).unwrap(), 3.0);
    }

    #[test]
    fn substring_tags_do_not_collide() {
        // Textual replacement of `A` would corrupt `AB` and `A_2`.
        let v = values(&[("A", 2.0), ("AB", 10.0), ("A_2", 3.0)]);
        assert_eq!(evaluate("AB - A", &v).unwrap(), 8.0);
        assert_eq!(evaluate("A_2 * A", &v).unwrap(), 6.0);
    }

    #[test]
    fn evaluation_is_repeatable() {
        let v = values(&[("U", 1.25), ("I", 0.004)]);
        let first = evaluate("U * I * 1000", &v).unwrap();
        let second = evaluate("U * I * 1000", &v).unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn matches_direct_evaluation() {
        let (a, b, c) = (0.731, -2.5, 11.0);
        let v = values(&[("Va", a), ("Vb", b), ("Vc", c)]);
        let computed = evaluate("(Va - Vb) * Vc / 47 + Va ^ 2", &v).unwrap();
        assert_relative_eq!(computed, (a - b) * c / 47.0 + a.powf(2.0));
    }

    #[test]
    fn bound_expression_uses_scan_positions() {
        let expr = Expression::parse("B - A").unwrap();
        let bound = expr.bind(&["A", "B", "C"]).unwrap();
        assert_eq!(bound.evaluate(&[1.0, 5.0, 100.0]).unwrap(), 4.0);
        assert_eq!(bound.source(), "B - A");
    }

    #[test]
    fn binding_rejects_unknown_tags() {
        let expr = Expression::parse("A + X").unwrap();
        assert_eq!(
            expr.bind(&["A", "B"]).unwrap_err(),
            CalcError::UnknownChannelTag("X".into())
        );
    }

    #[test]
    fn identifiers_are_collected() {
        let expr = Expression::parse("B * (A + B) - 3").unwrap();
        assert_eq!(expr.identifiers().into_iter().collect::<Vec<_>>(), ["A", "B"]);
    }
}
