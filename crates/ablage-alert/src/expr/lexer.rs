use ablage_core::{AblageError, Result};
use chrono::Duration;

/// 词法单元
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    /// `[5m]` 形式的时间窗口
    Range(Duration),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    /// `=`
    Assign,
    /// `!=`
    NotEqual,
    /// `=~`
    RegexMatch,
    /// `!~`
    RegexNotMatch,
    /// `==`
    EqEq,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

/// 带位置的词法单元
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn parse_error(offset: usize, message: impl Into<String>) -> AblageError {
    AblageError::Parse {
        offset,
        message: message.into(),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

/// 把表达式切分为词法单元，末尾总是 `Token::Eof`
pub fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, consumed) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            (',', _) => (Token::Comma, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('=', Some('~')) => (Token::RegexMatch, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', Some('=')) => (Token::NotEqual, 2),
            ('!', Some('~')) => (Token::RegexNotMatch, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('>', _) => (Token::Gt, 1),
            ('<', Some('=')) => (Token::Le, 2),
            ('<', _) => (Token::Lt, 1),
            ('[', _) => {
                let close = chars[i..]
                    .iter()
                    .position(|(_, c)| *c == ']')
                    .ok_or_else(|| parse_error(offset, "unclosed '['"))?;
                let text: String = chars[i + 1..i + close].iter().map(|(_, c)| c).collect();
                let window = humantime::parse_duration(text.trim())
                    .map_err(|e| parse_error(offset, format!("invalid range '{}': {}", text, e)))?;
                let window = Duration::from_std(window)
                    .map_err(|e| parse_error(offset, format!("range out of bounds: {}", e)))?;
                if window <= Duration::zero() {
                    return Err(parse_error(offset, "range must be positive"));
                }
                (Token::Range(window), close + 1)
            }
            ('"', _) | ('\'', _) => {
                let (value, consumed) = read_string(&chars[i..], c, offset)?;
                (Token::Str(value), consumed)
            }
            (c, _) if c.is_ascii_digit() || c == '.' => {
                let len = chars[i..]
                    .iter()
                    .enumerate()
                    .take_while(|(idx, (_, ch))| {
                        ch.is_ascii_alphanumeric()
                            || *ch == '.'
                            || ((*ch == '+' || *ch == '-')
                                && *idx > 0
                                && matches!(chars[i + idx - 1].1, 'e' | 'E'))
                    })
                    .count();
                let text: String = chars[i..i + len].iter().map(|(_, c)| c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(offset, format!("invalid number '{}'", text)))?;
                (Token::Number(value), len)
            }
            (c, _) if is_ident_start(c) => {
                let len = chars[i..].iter().take_while(|(_, c)| is_ident_char(*c)).count();
                let text: String = chars[i..i + len].iter().map(|(_, c)| c).collect();
                (Token::Ident(text), len)
            }
            (c, _) => return Err(parse_error(offset, format!("unexpected character '{}'", c))),
        };

        tokens.push(Spanned { token, offset });
        i += consumed;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        offset: input.len(),
    });
    Ok(tokens)
}

fn read_string(chars: &[(usize, char)], quote: char, offset: usize) -> Result<(String, usize)> {
    let mut value = String::new();
    let mut i = 1;

    while i < chars.len() {
        match chars[i].1 {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .map(|(_, c)| *c)
                    .ok_or_else(|| parse_error(offset, "unterminated escape"))?;
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((value, i + 1)),
            c => {
                value.push(c);
                i += 1;
            }
        }
    }

    Err(parse_error(offset, "unterminated string"))
}
