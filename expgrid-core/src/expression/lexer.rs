// Expression Lexer
// Tokenizes arithmetic formulas and boolean selection predicates

use std::fmt;

/// Token types for formulas and predicates
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    True,
    False,
    Number(f64),
    String(String),

    // Bare words (unquoted text, compared as strings)
    Word(String),

    // Operators
    Plus,    // +
    Minus,   // -
    Star,    // *
    Slash,   // /
    Percent, // %
    Eq,      // ==
    Ne,      // !=
    Lt,      // <
    Le,      // <=
    Gt,      // >
    Ge,      // >=
    And,     // && / and
    Or,      // || / or
    Not,     // ! / not

    // Delimiters
    LParen, // (
    RParen, // )

    // End of input
    Eof,
}

impl Token {
    /// Whether this token may appear in a pure arithmetic expression
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Token::Number(_)
                | Token::Plus
                | Token::Minus
                | Token::Star
                | Token::Slash
                | Token::Percent
                | Token::LParen
                | Token::RParen
                | Token::Eof
        )
    }

    /// Whether this token is an arithmetic operator
    pub fn is_arithmetic_operator(&self) -> bool {
        matches!(
            self,
            Token::Plus | Token::Minus | Token::Star | Token::Slash | Token::Percent
        )
    }
}

impl Token {
    fn symbol(&self) -> Option<&'static str> {
        let text = match self {
            Token::True => "true",
            Token::False => "false",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::And => "and",
            Token::Or => "or",
            Token::Not => "not",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Eof => "end of input",
            Token::Number(_) | Token::String(_) | Token::Word(_) => return None,
        };
        Some(text)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Word(w) => f.write_str(w),
            other => f.write_str(other.symbol().unwrap_or("?")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    /// Byte offset into the input
    pub position: usize,
}

impl LexError {
    fn at(position: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at offset {})", self.message, self.position)
    }
}

impl std::error::Error for LexError {}

/// Lexer over an already-substituted formula or predicate
pub struct Lexer<'a> {
    input: &'a str,
    offset: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, offset: 0 }
    }

    /// All tokens, terminated by [`Token::Eof`]
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            if token == Token::Eof {
                tokens.push(token);
                return Ok(tokens);
            }
            tokens.push(token);
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.take_while(char::is_whitespace);

        let start = self.offset;
        let Some(ch) = self.bump() else {
            return Ok(Token::Eof);
        };

        let token = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '!' => self.or_with_eq(Token::Not, Token::Ne),
            '<' => self.or_with_eq(Token::Lt, Token::Le),
            '>' => self.or_with_eq(Token::Gt, Token::Ge),
            '=' | '&' | '|' => {
                if !self.eat(ch) {
                    return Err(LexError::at(start, format!("expected '{0}{0}' operator", ch)));
                }
                match ch {
                    '=' => Token::Eq,
                    '&' => Token::And,
                    _ => Token::Or,
                }
            }
            '\'' | '"' => self.quoted(start, ch)?,
            '0'..='9' | '.' => self.number(start)?,
            c if c.is_alphabetic() || c == '_' => self.word(start),
            other => {
                return Err(LexError::at(start, format!("unexpected character: '{}'", other)))
            }
        };
        Ok(token)
    }

    fn rest(&self) -> &'a str {
        &self.input[self.offset..]
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.rest().chars().next()?;
        self.offset += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.rest().starts_with(expected) {
            self.offset += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn take_while(&mut self, mut keep: impl FnMut(char) -> bool) -> &'a str {
        let rest = self.rest();
        let len = rest.find(|c: char| !keep(c)).unwrap_or(rest.len());
        self.offset += len;
        &rest[..len]
    }

    /// `plain`, or `with_eq` when an `=` follows
    fn or_with_eq(&mut self, plain: Token, with_eq: Token) -> Token {
        if self.eat('=') {
            with_eq
        } else {
            plain
        }
    }

    fn quoted(&mut self, start: usize, quote: char) -> Result<Token, LexError> {
        let mut value = String::new();
        while let Some(ch) = self.bump() {
            match ch {
                '\\' => match self.bump() {
                    Some(escaped) => value.push(escaped),
                    None => break,
                },
                c if c == quote => return Ok(Token::String(value)),
                c => value.push(c),
            }
        }
        Err(LexError::at(start, "unterminated string"))
    }

    fn number(&mut self, start: usize) -> Result<Token, LexError> {
        let mut seen_dot = self.input[start..].starts_with('.');
        self.take_while(|c| {
            if c == '.' && !seen_dot {
                seen_dot = true;
                return true;
            }
            c.is_ascii_digit()
        });
        let text = &self.input[start..self.offset];

        // `01` is not a number here, so dates and zero-padded ids stay text
        let bytes = text.as_bytes();
        if bytes.len() > 1 && bytes[0] == b'0' && bytes[1].is_ascii_digit() {
            return Err(LexError::at(start, format!("leading zeros are not allowed: {}", text)));
        }

        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError::at(start, format!("invalid number: {}", text)))
    }

    fn word(&mut self, start: usize) -> Token {
        self.take_while(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'));
        match &self.input[start..self.offset] {
            "true" | "True" => Token::True,
            "false" | "False" => Token::False,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            word => Token::Word(word.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(input: &str) -> Vec<Token> {
        Lexer::new(input).tokenize().unwrap()
    }

    #[test]
    fn test_lexer_arithmetic_tokens() {
        assert_eq!(
            lex("16 * (2 + 1)"),
            vec![
                Token::Number(16.0),
                Token::Star,
                Token::LParen,
                Token::Number(2.0),
                Token::Plus,
                Token::Number(1.0),
                Token::RParen,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_comparison_and_keywords() {
        assert_eq!(
            lex("a == b and not c or d != 2"),
            vec![
                Token::Word("a".to_string()),
                Token::Eq,
                Token::Word("b".to_string()),
                Token::And,
                Token::Not,
                Token::Word("c".to_string()),
                Token::Or,
                Token::Word("d".to_string()),
                Token::Ne,
                Token::Number(2.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_both_quote_styles() {
        assert_eq!(
            lex(r#""serial" == 'serial'"#),
            vec![
                Token::String("serial".to_string()),
                Token::Eq,
                Token::String("serial".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_lexer_escaped_quote() {
        assert_eq!(
            lex(r#""say \"hi\"""#),
            vec![Token::String("say \"hi\"".to_string()), Token::Eof]
        );
    }

    #[test]
    fn test_lexer_decimal_number() {
        assert_eq!(lex("2.5"), vec![Token::Number(2.5), Token::Eof]);
        assert_eq!(lex("0.5"), vec![Token::Number(0.5), Token::Eof]);
    }

    #[test]
    fn test_lexer_rejects_leading_zero() {
        let err = Lexer::new("2024-01-01").tokenize().unwrap_err();
        assert!(err.message.contains("leading zeros"));
    }

    #[test]
    fn test_lexer_unterminated_string() {
        let err = Lexer::new("'abc").tokenize().unwrap_err();
        assert_eq!(err.position, 0);
    }

    #[test]
    fn test_lexer_single_ampersand_is_error() {
        assert!(Lexer::new("a & b").tokenize().is_err());
    }

    #[test]
    fn test_is_arithmetic() {
        assert!(lex("1 + 2").iter().all(Token::is_arithmetic));
        assert!(!lex("1 + x").iter().all(Token::is_arithmetic));
    }
}
