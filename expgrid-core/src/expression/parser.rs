// Expression Parser
// Precedence climbing over formula and predicate tokens

use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;

/// Abstract Syntax Tree node for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Boolean literal
    Bool(bool),

    /// Number literal
    Number(f64),

    /// Quoted string or bare word
    String(String),

    /// Unary operation: not expr, -expr
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Binary operation: a == b, a * b
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not, // not, !
    Neg, // -
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add, // +
    Sub, // -
    Mul, // *
    Div, // /
    Mod, // %

    // Comparison
    Eq, // ==
    Ne, // !=
    Lt, // <
    Le, // <=
    Gt, // >
    Ge, // >=

    // Logical
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        };
        write!(f, "{}", symbol)
    }
}

/// Parser error
#[derive(Debug, Clone, PartialEq)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at token {}: {}",
            self.position, self.message
        )
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

const NOT_PRECEDENCE: u8 = 3;

fn binary_operator(token: &Token) -> Option<(BinaryOp, u8)> {
    let entry = match token {
        Token::Or => (BinaryOp::Or, 1),
        Token::And => (BinaryOp::And, 2),
        Token::Eq => (BinaryOp::Eq, 4),
        Token::Ne => (BinaryOp::Ne, 4),
        Token::Lt => (BinaryOp::Lt, 5),
        Token::Le => (BinaryOp::Le, 5),
        Token::Gt => (BinaryOp::Gt, 5),
        Token::Ge => (BinaryOp::Ge, 5),
        Token::Plus => (BinaryOp::Add, 6),
        Token::Minus => (BinaryOp::Sub, 6),
        Token::Star => (BinaryOp::Mul, 7),
        Token::Slash => (BinaryOp::Div, 7),
        Token::Percent => (BinaryOp::Mod, 7),
        _ => return None,
    };
    Some(entry)
}

/// Parses a token stream produced by [`Lexer`]
pub struct ExprParser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, cursor: 0 }
    }

    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    /// The whole stream must form one expression
    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        let expr = self.parse_binary(0)?;
        match self.current() {
            Token::Eof => Ok(expr),
            trailing => Err(self.fail(format!("unexpected token: {}", trailing))),
        }
    }

    /// Precedence climbing; every binary operator is left associative.
    /// `not` sits between `and` and the comparisons, unary minus binds
    /// tightest.
    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr, ParseExprError> {
        let mut left = if min_precedence <= NOT_PRECEDENCE && self.eat(&Token::Not) {
            let operand = self.parse_binary(NOT_PRECEDENCE)?;
            Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(operand),
            }
        } else {
            self.parse_operand()?
        };

        loop {
            let (op, precedence) = match binary_operator(self.current()) {
                Some(found) if found.1 >= min_precedence => found,
                _ => break,
            };
            self.cursor += 1;
            let right = self.parse_binary(precedence + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn parse_operand(&mut self) -> Result<Expr, ParseExprError> {
        let at = self.cursor;
        let token = self.current().clone();
        self.cursor += 1;

        match token {
            Token::Minus => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.parse_operand()?),
            }),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::String(s) | Token::Word(s) => Ok(Expr::String(s)),
            Token::LParen => {
                let inner = self.parse_binary(0)?;
                if !self.eat(&Token::RParen) {
                    return Err(self.fail("expected ')'".to_string()));
                }
                Ok(inner)
            }
            other => Err(ParseExprError {
                message: format!("unexpected token: {}", other),
                position: at,
            }),
        }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.cursor).unwrap_or(&Token::Eof)
    }

    /// Consume the current token if it is the same kind as `token`
    fn eat(&mut self, token: &Token) -> bool {
        let same = std::mem::discriminant(self.current()) == std::mem::discriminant(token);
        if same {
            self.cursor += 1;
        }
        same
    }

    fn fail(&self, message: String) -> ParseExprError {
        ParseExprError {
            message,
            position: self.cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(ExprParser::parse_str("true").unwrap(), Expr::Bool(true));
        assert_eq!(ExprParser::parse_str("42").unwrap(), Expr::Number(42.0));
        assert_eq!(
            ExprParser::parse_str("'hello'").unwrap(),
            Expr::String("hello".to_string())
        );
        assert_eq!(
            ExprParser::parse_str("serial").unwrap(),
            Expr::String("serial".to_string())
        );
    }

    #[test]
    fn test_parse_operator_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let expr = ExprParser::parse_str("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(
                *right,
                Expr::Binary {
                    op: BinaryOp::Mul,
                    ..
                }
            )),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_not_binds_looser_than_equality() {
        let expr = ExprParser::parse_str("not a == b").unwrap();
        match expr {
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => assert!(matches!(
                *expr,
                Expr::Binary {
                    op: BinaryOp::Eq,
                    ..
                }
            )),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_and_or_keywords() {
        let expr = ExprParser::parse_str("a == b or c == d and e == f").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = ExprParser::parse_str("(1 + 2) * 3").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_trailing_tokens_error() {
        assert!(ExprParser::parse_str("1 2").is_err());
        assert!(ExprParser::parse_str("(1 + 2").is_err());
    }
}
