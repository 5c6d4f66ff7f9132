//! Parser for the textual kernel-IR format
//!
//! Parses modules like:
//!
//! ```text
//! func fir {
//!   loop 0 {
//!     %i = phi %i.next
//!     %p = getelementptr %input, %i
//!     %v = load %p
//!     %m = fmul %v, %coef
//!     %acc = phi %acc.next
//!     %acc.next = fadd %acc, %m
//!     %i.next = add %i, %one
//!     %cmp = icmp %i.next, %n
//!     br %cmp
//!   }
//! }
//! ```
//!
//! Operations are assigned dense ids in source order across the whole
//! function. Numeric literals in operand position are immediates and do
//! not become SSA operands.

use crate::error::{MapperError, MapperResult};
use crate::ir::{Function, Loop, LoopTree, OpId};
use crate::lexer::{Lexer, Token};

/// A parsed module: each function paired with its loop tree
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<(Function, LoopTree)>,
}

impl Module {
    /// Find a function by name
    pub fn function(&self, name: &str) -> Option<&(Function, LoopTree)> {
        self.functions.iter().find(|(f, _)| f.name == name)
    }
}

/// Parser for kernel-IR text
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next().and_then(Result::ok);
        Self { lexer, current }
    }

    /// Advance to the next token
    fn advance(&mut self) -> Option<Token> {
        let prev = self.current.take();
        self.current = self.lexer.next().and_then(Result::ok);
        prev
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> MapperResult<Token> {
        if self.check(&expected) {
            Ok(self.advance().unwrap())
        } else {
            Err(MapperError::parse_error(format!(
                "Expected {:?}, got {:?}",
                expected, self.current
            )))
        }
    }

    /// Skip any run of newline tokens
    fn skip_newlines(&mut self) {
        while self.check(&Token::Newline) {
            self.advance();
        }
    }

    /// Parse a complete module (one or more functions)
    pub fn parse_module(&mut self) -> MapperResult<Module> {
        let mut module = Module::default();

        self.skip_newlines();
        while self.current.is_some() {
            module.functions.push(self.parse_function()?);
            self.skip_newlines();
        }

        if module.functions.is_empty() {
            return Err(MapperError::parse_error("no functions in module"));
        }
        Ok(module)
    }

    /// Parse `func NAME { ... }`
    fn parse_function(&mut self) -> MapperResult<(Function, LoopTree)> {
        self.expect(Token::KwFunc)?;
        let name = match self.advance() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(MapperError::parse_error(format!(
                    "Expected function name, got {:?}",
                    other
                )))
            }
        };
        self.expect(Token::LBrace)?;
        self.skip_newlines();

        let mut function = Function::new(name);
        let mut tree = LoopTree::default();

        while !self.check(&Token::RBrace) {
            if self.current.is_none() {
                return Err(MapperError::parse_error("unterminated function body"));
            }
            if self.check(&Token::KwLoop) {
                let l = self.parse_loop(&mut function)?;
                tree.loops.push(l);
            } else {
                self.parse_operation(&mut function)?;
            }
            self.skip_newlines();
        }
        self.expect(Token::RBrace)?;

        Ok((function, tree))
    }

    /// Parse `loop N { ... }`, appending its operations to `function`
    fn parse_loop(&mut self, function: &mut Function) -> MapperResult<Loop> {
        self.expect(Token::KwLoop)?;
        let id = match self.advance() {
            Some(Token::Number(id)) => id,
            other => {
                return Err(MapperError::parse_error(format!(
                    "Expected loop id, got {:?}",
                    other
                )))
            }
        };
        self.expect(Token::LBrace)?;
        self.skip_newlines();

        let mut body: Vec<OpId> = Vec::new();
        let mut subloops = Vec::new();

        while !self.check(&Token::RBrace) {
            if self.current.is_none() {
                return Err(MapperError::parse_error("unterminated loop body"));
            }
            if self.check(&Token::KwLoop) {
                let sub = self.parse_loop(function)?;
                body.extend(sub.body.iter().copied());
                subloops.push(sub);
            } else {
                body.push(self.parse_operation(function)?);
            }
            self.skip_newlines();
        }
        self.expect(Token::RBrace)?;

        let header = *body.first().ok_or_else(|| {
            MapperError::parse_error(format!("loop {} has an empty body", id))
        })?;
        Ok(Loop {
            id,
            header,
            body,
            subloops,
        })
    }

    /// Parse one operation line: `[%result =] opcode [operand, ...]`
    fn parse_operation(&mut self, function: &mut Function) -> MapperResult<OpId> {
        let result = if matches!(self.current, Some(Token::Value(_))) {
            let name = match self.advance() {
                Some(Token::Value(name)) => name,
                _ => unreachable!(),
            };
            self.expect(Token::Equals)?;
            Some(function.intern_value(&name))
        } else {
            None
        };

        let opcode = match self.advance() {
            Some(Token::Ident(op)) => op,
            other => {
                return Err(MapperError::parse_error(format!(
                    "Expected opcode, got {:?}",
                    other
                )))
            }
        };

        let mut operands = Vec::new();
        if matches!(self.current, Some(Token::Value(_)) | Some(Token::Number(_))) {
            self.parse_operand(function, &mut operands)?;
            while self.check(&Token::Comma) {
                self.advance();
                self.parse_operand(function, &mut operands)?;
            }
        }

        // An op line ends at a newline or at the closing brace.
        if !self.check(&Token::RBrace) && self.current.is_some() {
            self.expect(Token::Newline)?;
        }

        Ok(function.push_operation(opcode, operands, result))
    }

    /// Parse a single operand; immediates are consumed but not recorded
    fn parse_operand(
        &mut self,
        function: &mut Function,
        operands: &mut Vec<usize>,
    ) -> MapperResult<()> {
        match self.advance() {
            Some(Token::Value(name)) => {
                operands.push(function.intern_value(&name));
                Ok(())
            }
            Some(Token::Number(_)) => Ok(()),
            other => Err(MapperError::parse_error(format!(
                "Expected operand, got {:?}",
                other
            ))),
        }
    }
}
