// Expression Module
// Arithmetic for formula variables and boolean selection predicates

pub mod evaluator;
pub mod lexer;
pub mod parser;

pub use evaluator::{evaluate_arithmetic, evaluate_predicate, values_equal, EvalError, Evaluator};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError, UnaryOp};
