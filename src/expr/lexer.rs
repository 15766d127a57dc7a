//! Tokenizer for the expression language.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Ident(String),
    True,
    False,
    Dot,
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `&`, `&&`, `and`
    And,
    /// `|`, `||`, `or`
    Or,
    /// `!` and `~`, binding as tightly as unary minus.
    Bang,
    /// The `not` keyword, binding looser than comparisons.
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub pos: usize,
    pub msg: String,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let two = if i + 1 < bytes.len() { &bytes[i..i + 2] } else { &bytes[i..i + 1] };
        let double = match two {
            b"**" => Some(TokenKind::StarStar),
            b"==" => Some(TokenKind::Eq),
            b"!=" => Some(TokenKind::Ne),
            b"<=" => Some(TokenKind::Le),
            b">=" => Some(TokenKind::Ge),
            b"&&" => Some(TokenKind::And),
            b"||" => Some(TokenKind::Or),
            _ => None,
        };
        if let Some(kind) = double {
            i += 2;
            tokens.push(Token { kind, span: Span { start, end: i } });
            continue;
        }

        let starts_number = b.is_ascii_digit()
            || (b == b'.' && bytes.get(i + 1).is_some_and(|c| c.is_ascii_digit()));

        let kind = if starts_number {
            i = scan_number(bytes, i);
            let text = &input[start..i];
            let value = text.parse::<f64>().map_err(|_| LexError {
                pos: start,
                msg: format!("invalid number literal '{}'", text),
            })?;
            TokenKind::Number(value)
        } else if b.is_ascii_alphabetic() || b == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            match &input[start..i] {
                "true" | "True" => TokenKind::True,
                "false" | "False" => TokenKind::False,
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "not" => TokenKind::Not,
                word => TokenKind::Ident(word.to_string()),
            }
        } else {
            i += 1;
            match b {
                b'.' => TokenKind::Dot,
                b',' => TokenKind::Comma,
                b'(' => TokenKind::LParen,
                b')' => TokenKind::RParen,
                b'+' => TokenKind::Plus,
                b'-' => TokenKind::Minus,
                b'*' => TokenKind::Star,
                b'/' => TokenKind::Slash,
                b'%' => TokenKind::Percent,
                b'<' => TokenKind::Lt,
                b'>' => TokenKind::Gt,
                b'&' => TokenKind::And,
                b'|' => TokenKind::Or,
                b'!' | b'~' => TokenKind::Bang,
                _ => {
                    let ch = input[start..].chars().next().unwrap_or('?');
                    return Err(LexError { pos: start, msg: format!("unexpected character '{}'", ch) });
                }
            }
        };
        tokens.push(Token { kind, span: Span { start, end: i } });
    }

    Ok(tokens)
}

fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

/// Whitespace-normalized form of an expression: token texts joined by single spaces.
pub fn normalize(input: &str, tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| &input[t.span.start..t.span.end])
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(s: &str) -> Vec<TokenKind> {
        tokenize(s).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_dotted_reference_and_numbers() {
        assert_eq!(
            kinds("skims.SOV_TIME * 1.5e-1"),
            vec![
                TokenKind::Ident("skims".into()),
                TokenKind::Dot,
                TokenKind::Ident("SOV_TIME".into()),
                TokenKind::Star,
                TokenKind::Number(0.15),
            ]
        );
        assert_eq!(kinds(".5"), vec![TokenKind::Number(0.5)]);
    }

    #[test]
    fn test_operator_aliases() {
        assert_eq!(kinds("a & b"), kinds("a and b"));
        assert_eq!(kinds("a || b"), kinds("a or b"));
        assert_eq!(kinds("~a"), kinds("!a"));
        assert_eq!(kinds("2**3")[1], TokenKind::StarStar);
        assert_eq!(kinds("True")[0], TokenKind::True);
    }

    #[test]
    fn test_bad_character_reports_position() {
        let err = tokenize("a + $b").unwrap_err();
        assert_eq!(err.pos, 4);
        assert!(err.msg.contains('$'));
    }

    #[test]
    fn test_bad_number_is_rejected() {
        assert!(tokenize("1.2.3").is_err());
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        let src = "  a.x   +\t1 ";
        let toks = tokenize(src).unwrap();
        assert_eq!(normalize(src, &toks), "a . x + 1");
        let other = "a.x+1";
        assert_eq!(normalize(other, &tokenize(other).unwrap()), "a . x + 1");
    }
}
