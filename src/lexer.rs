//! Lexer for the textual kernel-IR format using logos
//!
//! The format is a minimal SSA rendering of a loop kernel:
//! - Values: %acc, %i.next
//! - Opcodes: add, fmul, load, phi, ...
//! - Structure: func NAME { loop N { ... } }
//! - Comments: # to end of line
//!
//! Newlines are significant: they terminate an operation line.

use logos::Logos;

/// Token types for the kernel-IR language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[token("func")]
    KwFunc,

    #[token("loop")]
    KwLoop,

    // SSA value reference, without the leading '%'
    #[regex(r"%[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice()[1..].to_string())]
    Value(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<usize>().ok())]
    Number(usize),

    // Opcode names and bare identifiers
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("=")]
    Equals,

    #[token(",")]
    Comma,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token("\n")]
    Newline,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::KwFunc => write!(f, "func"),
            Token::KwLoop => write!(f, "loop"),
            Token::Value(s) => write!(f, "%{}", s),
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Equals => write!(f, "="),
            Token::Comma => write!(f, ","),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Newline => write!(f, "\\n"),
        }
    }
}

/// Lexer wrapper that provides a stream of tokens
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<Option<Result<Token, ()>>>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Get current position in source
    pub fn span(&self) -> std::ops::Range<usize> {
        self.inner.span()
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> Option<&Result<Token, ()>> {
        if self.peeked.is_none() {
            self.peeked = Some(self.inner.next());
        }
        self.peeked.as_ref().unwrap().as_ref()
    }

    /// Check if the next token matches expected
    pub fn check(&mut self, expected: &Token) -> bool {
        match self.peek() {
            Some(Ok(tok)) => tok == expected,
            _ => false,
        }
    }

    /// Check if the next token is a value reference
    pub fn check_value(&mut self) -> bool {
        matches!(self.peek(), Some(Ok(Token::Value(_))))
    }

    /// Check if the next token is a number
    pub fn check_number(&mut self) -> bool {
        matches!(self.peek(), Some(Ok(Token::Number(_))))
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<Token, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(peeked) = self.peeked.take() {
            peeked
        } else {
            self.inner.next()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_line() {
        let source = "%c = add %a, %b";
        let tokens: Vec<_> = Lexer::new(source).filter_map(Result::ok).collect();
        assert_eq!(
            tokens,
            vec![
                Token::Value("c".to_string()),
                Token::Equals,
                Token::Ident("add".to_string()),
                Token::Value("a".to_string()),
                Token::Comma,
                Token::Value("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_structure_tokens() {
        let source = "func fir { loop 0 { } }";
        let tokens: Vec<_> = Lexer::new(source).filter_map(Result::ok).collect();
        assert_eq!(
            tokens,
            vec![
                Token::KwFunc,
                Token::Ident("fir".to_string()),
                Token::LBrace,
                Token::KwLoop,
                Token::Number(0),
                Token::LBrace,
                Token::RBrace,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn test_comments_and_newlines() {
        let source = "# header\n%v = load %p # trailing\n";
        let tokens: Vec<_> = Lexer::new(source).filter_map(Result::ok).collect();
        assert_eq!(
            tokens,
            vec![
                Token::Newline,
                Token::Value("v".to_string()),
                Token::Equals,
                Token::Ident("load".to_string()),
                Token::Value("p".to_string()),
                Token::Newline,
            ]
        );
    }

    #[test]
    fn test_dotted_value_names() {
        let source = "%i.next";
        let tokens: Vec<_> = Lexer::new(source).filter_map(Result::ok).collect();
        assert_eq!(tokens, vec![Token::Value("i.next".to_string())]);
    }
}
