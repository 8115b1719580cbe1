// Expression Evaluator
// Evaluates parsed formulas and predicates over scalar values

use crate::expression::lexer::{Lexer, Token};
use crate::expression::parser::{BinaryOp, Expr, ExprParser, UnaryOp};
use crate::variables::Value;

use std::fmt;

/// Evaluation error
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Stateless evaluator. References are substituted before parsing, so there
/// is no context to look anything up in.
#[derive(Debug, Default, Clone, Copy)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an expression
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Unary { op, expr } => {
                let val = self.eval(expr)?;
                self.eval_unary(*op, &val)
            }

            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    if !self.eval(left)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.eval(right)?.is_truthy()))
                }
                BinaryOp::Or => {
                    if self.eval(left)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.eval(right)?.is_truthy()))
                }
                _ => {
                    let left_val = self.eval(left)?;
                    let right_val = self.eval(right)?;
                    self.eval_binary(*op, &left_val, &right_val)
                }
            },
        }
    }

    fn eval_unary(&self, op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
            UnaryOp::Neg => value
                .as_number()
                .map(|n| Value::Number(-n))
                .ok_or_else(|| EvalError::new(format!("cannot negate '{}'", value))),
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match op {
            BinaryOp::Add => self.eval_add(left, right),
            BinaryOp::Sub => self.eval_numeric_op(op, left, right, |a, b| Some(a - b)),
            BinaryOp::Mul => self.eval_numeric_op(op, left, right, |a, b| Some(a * b)),
            BinaryOp::Div => {
                self.eval_numeric_op(op, left, right, |a, b| (b != 0.0).then(|| a / b))
            }
            BinaryOp::Mod => {
                self.eval_numeric_op(op, left, right, |a, b| (b != 0.0).then(|| a % b))
            }

            BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
            BinaryOp::Lt => self.eval_comparison(left, right, |o| o.is_lt()),
            BinaryOp::Le => self.eval_comparison(left, right, |o| o.is_le()),
            BinaryOp::Gt => self.eval_comparison(left, right, |o| o.is_gt()),
            BinaryOp::Ge => self.eval_comparison(left, right, |o| o.is_ge()),

            BinaryOp::And | BinaryOp::Or => Err(EvalError::new("logical operator out of place")),
        }
    }

    fn eval_add(&self, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok(Value::Number(a + b)),
            _ => Ok(Value::String(format!(
                "{}{}",
                left.as_string(),
                right.as_string()
            ))),
        }
    }

    fn eval_numeric_op<F>(
        &self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
        f: F,
    ) -> Result<Value, EvalError>
    where
        F: FnOnce(f64, f64) -> Option<f64>,
    {
        let a = left
            .as_number()
            .ok_or_else(|| EvalError::new(format!("'{}' is not a number", left)))?;
        let b = right
            .as_number()
            .ok_or_else(|| EvalError::new(format!("'{}' is not a number", right)))?;
        f(a, b)
            .map(Value::Number)
            .ok_or_else(|| EvalError::new(format!("division by zero in '{} {} {}'", a, op, b)))
    }

    fn eval_comparison<F>(&self, left: &Value, right: &Value, f: F) -> Result<Value, EvalError>
    where
        F: FnOnce(std::cmp::Ordering) -> bool,
    {
        let ordering = match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .ok_or_else(|| EvalError::new("values are not comparable"))?,
            _ => left.as_string().cmp(&right.as_string()),
        };
        Ok(Value::Bool(f(ordering)))
    }
}

/// Equality with numeric coercion: `"16" == 16` holds
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return (a - b).abs() < f64::EPSILON;
    }
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Bool(a), Value::String(s)) | (Value::String(s), Value::Bool(a)) => {
            s.eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        _ => left.as_string() == right.as_string(),
    }
}

/// Evaluate `text` if it is pure arithmetic over numbers.
///
/// Returns `None` when the text is anything else: contains words or quotes,
/// has no operator, uses zero-padded numbers, or divides by zero. Callers
/// keep such text verbatim.
pub fn evaluate_arithmetic(text: &str) -> Option<f64> {
    let tokens = Lexer::new(text).tokenize().ok()?;
    if !tokens.iter().all(Token::is_arithmetic) {
        return None;
    }
    if !tokens.iter().any(Token::is_arithmetic_operator) {
        return None;
    }
    let expr = ExprParser::new(tokens).parse().ok()?;
    match Evaluator::new().eval(&expr).ok()? {
        Value::Number(n) if n.is_finite() => Some(n),
        _ => None,
    }
}

/// Evaluate an already-substituted boolean predicate
pub fn evaluate_predicate(text: &str) -> Result<bool, EvalError> {
    let expr = ExprParser::parse_str(text).map_err(|e| EvalError::new(e.to_string()))?;
    Ok(Evaluator::new().eval(&expr)?.is_truthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_arithmetic() {
        assert_eq!(evaluate_arithmetic("16*2"), Some(32.0));
        assert_eq!(evaluate_arithmetic("(1 + 3) / 2"), Some(2.0));
        assert_eq!(evaluate_arithmetic("7 % 4"), Some(3.0));
        assert_eq!(evaluate_arithmetic("-3 + 1"), Some(-2.0));
        assert_eq!(evaluate_arithmetic("10 / 4"), Some(2.5));
    }

    #[test]
    fn test_evaluate_arithmetic_rejects_non_arithmetic() {
        assert_eq!(evaluate_arithmetic("16"), None);
        assert_eq!(evaluate_arithmetic("node-1"), None);
        assert_eq!(evaluate_arithmetic("2024-01-01"), None);
        assert_eq!(evaluate_arithmetic("1.2.3"), None);
        assert_eq!(evaluate_arithmetic("4 / 0"), None);
        assert_eq!(evaluate_arithmetic("hostname -s"), None);
        assert_eq!(evaluate_arithmetic(""), None);
    }

    #[test]
    fn test_evaluate_predicate_equality() {
        assert!(evaluate_predicate(r#""serial" == "serial""#).unwrap());
        assert!(!evaluate_predicate("'serial' == 'parallel'").unwrap());
        assert!(evaluate_predicate("serial != parallel").unwrap());
    }

    #[test]
    fn test_evaluate_predicate_numeric() {
        assert!(evaluate_predicate("32 <= 64").unwrap());
        assert!(evaluate_predicate("16 * 2 == 32").unwrap());
        assert!(evaluate_predicate("'16' == 16").unwrap());
        assert!(!evaluate_predicate("100 < 64").unwrap());
    }

    #[test]
    fn test_evaluate_predicate_logical() {
        assert!(evaluate_predicate("1 == 1 and not 2 == 3").unwrap());
        assert!(evaluate_predicate("1 == 2 or true").unwrap());
        assert!(!evaluate_predicate("1 == 1 && false").unwrap());
        assert!(evaluate_predicate("!(1 > 2)").unwrap());
    }

    #[test]
    fn test_evaluate_predicate_short_circuits() {
        // right side would fail to evaluate as numbers
        assert!(!evaluate_predicate("false and a - b").unwrap());
    }

    #[test]
    fn test_evaluate_predicate_string_ordering() {
        assert!(evaluate_predicate("'abc' < 'abd'").unwrap());
    }

    #[test]
    fn test_evaluate_predicate_parse_error() {
        let err = evaluate_predicate("1 ==").unwrap_err();
        assert!(err.message.contains("parse error"));
    }

    #[test]
    fn test_values_equal_bool_string() {
        assert!(values_equal(&Value::Bool(true), &Value::from("True")));
        assert!(!values_equal(&Value::Bool(false), &Value::from("true")));
    }
}
