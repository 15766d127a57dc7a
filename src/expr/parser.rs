//! Recursive-descent parser producing an `Expr` tree.
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons (not chained),
//! `+ -`, `* / %`, unary `- + ! ~`, `**` (right associative).

use super::ast::{BinaryOp, Expr, Func, UnaryOp};
use super::lexer::{tokenize, Span, Token, TokenKind};
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub pos: usize,
    pub msg: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at offset {}", self.msg, self.pos)
    }
}

/// Parses a complete expression, returning it with its token stream.
pub fn parse(input: &str) -> Result<(Expr, Vec<Token>), ParseError> {
    let tokens = tokenize(input).map_err(|e| ParseError { pos: e.pos, msg: e.msg })?;
    if tokens.is_empty() {
        return Err(ParseError { pos: 0, msg: "empty expression".into() });
    }
    let mut parser = Parser { tokens: &tokens, pos: 0, len: input.len() };
    let expr = parser.parse_or()?;
    if let Some(t) = parser.peek() {
        return Err(ParseError {
            pos: t.span.start,
            msg: format!("unexpected {} after expression", describe(&t.kind)),
        });
    }
    Ok((expr, tokens))
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&'a TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn here(&self) -> usize {
        self.peek().map_or(self.len, |t| t.span.start)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<&'a Token, ParseError> {
        match self.peek() {
            Some(t) if t.kind == kind => {
                self.pos += 1;
                Ok(t)
            }
            Some(t) => Err(ParseError {
                pos: t.span.start,
                msg: format!("expected {} but found {}", what, describe(&t.kind)),
            }),
            None => Err(ParseError { pos: self.len, msg: format!("expected {} but input ended", what) }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.peek_kind() == Some(&TokenKind::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_not()?;
        while self.peek_kind() == Some(&TokenKind::And) {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.peek_kind() == Some(&TokenKind::Not) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_add()?;
        let Some(op) = self.peek_kind().and_then(comparison_op) else {
            return Ok(lhs);
        };
        self.pos += 1;
        let rhs = self.parse_add()?;
        if self.peek_kind().and_then(comparison_op).is_some() {
            return Err(ParseError {
                pos: self.here(),
                msg: "chained comparisons are not supported; combine them with 'and'".into(),
            });
        }
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                Some(TokenKind::Percent) => BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::Minus) => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(match inner {
                    Expr::Number(v) => Expr::Number(-v),
                    other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
                })
            }
            Some(TokenKind::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            Some(TokenKind::Bang) => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_atom()?;
        if self.peek_kind() == Some(&TokenKind::StarStar) {
            self.pos += 1;
            let exp = self.parse_unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let Some(tok) = self.bump() else {
            return Err(ParseError { pos: self.len, msg: "unexpected end of expression".into() });
        };
        match &tok.kind {
            TokenKind::Number(v) => Ok(Expr::Number(*v)),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(first) => self.parse_name(first, tok.span),
            other => Err(ParseError { pos: tok.span.start, msg: format!("unexpected {}", describe(other)) }),
        }
    }

    /// `name`, `node.name`, `func(...)` or `np.func(...)`.
    fn parse_name(&mut self, first: &str, start: Span) -> Result<Expr, ParseError> {
        let mut parts: SmallVec<[&str; 2]> = SmallVec::new();
        parts.push(first);
        let mut span = start;

        while self.peek_kind() == Some(&TokenKind::Dot) {
            self.pos += 1;
            match self.bump() {
                Some(Token { kind: TokenKind::Ident(s), span: s_span }) => {
                    parts.push(s.as_str());
                    span.end = s_span.end;
                }
                Some(t) => {
                    return Err(ParseError {
                        pos: t.span.start,
                        msg: format!("expected a name after '.' but found {}", describe(&t.kind)),
                    })
                }
                None => return Err(ParseError { pos: self.len, msg: "expected a name after '.'".into() }),
            }
        }

        if self.peek_kind() == Some(&TokenKind::LParen) {
            let fname = match parts.as_slice() {
                [f] => *f,
                ["np", f] | ["numpy", f] => *f,
                _ => {
                    return Err(ParseError {
                        pos: span.start,
                        msg: format!("'{}' is not a callable function", parts.join(".")),
                    })
                }
            };
            let func = Func::from_name(fname).ok_or_else(|| ParseError {
                pos: span.start,
                msg: format!("unsupported function '{}'", fname),
            })?;
            self.pos += 1;
            let args = self.parse_args()?;
            span.end = self.tokens[self.pos - 1].span.end;
            if args.len() != func.arity() {
                return Err(ParseError {
                    pos: span.start,
                    msg: format!(
                        "{}() takes {} arguments but {} were given",
                        func.name(),
                        func.arity(),
                        args.len()
                    ),
                });
            }
            return Ok(Expr::Call { func, args, span });
        }

        match parts.as_slice() {
            [name] => Ok(Expr::Name { node: None, name: name.to_string(), span }),
            [node, name] => Ok(Expr::Name { node: Some(node.to_string()), name: name.to_string(), span }),
            _ => Err(ParseError {
                pos: span.start,
                msg: format!("'{}' has too many '.' separators, expected 'node.variable'", parts.join(".")),
            }),
        }
    }

    fn parse_args(&mut self) -> Result<SmallVec<[Box<Expr>; 3]>, ParseError> {
        let mut args = SmallVec::new();
        if self.peek_kind() == Some(&TokenKind::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(Box::new(self.parse_or()?));
            match self.peek_kind() {
                Some(TokenKind::Comma) => self.pos += 1,
                _ => {
                    self.expect(TokenKind::RParen, "',' or ')'")?;
                    return Ok(args);
                }
            }
        }
    }
}

fn comparison_op(kind: &TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Eq => BinaryOp::Eq,
        TokenKind::Ne => BinaryOp::Ne,
        TokenKind::Lt => BinaryOp::Lt,
        TokenKind::Le => BinaryOp::Le,
        TokenKind::Gt => BinaryOp::Gt,
        TokenKind::Ge => BinaryOp::Ge,
        _ => return None,
    })
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Number(v) => format!("number {}", v),
        TokenKind::Ident(s) => format!("name '{}'", s),
        other => format!("{:?}", other),
    }
}
