use super::ast::{ArithOp, Comparator, Condition, Expr};
use super::lexer::{tokenize, Spanned, Token};
use ablage_core::{AblageError, LabelMatcher, MatchOp, Result};
use ablage_tsdb::{AggregateOp, RangeFunction, Selector};
use chrono::Duration;

/// 解析规则条件，表达式必须以对标量的顶层比较结尾
pub fn parse_condition(input: &str) -> Result<Condition> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_expr(1)?;

    let comparator = match parser.peek() {
        Token::Gt => Comparator::Greater,
        Token::Ge => Comparator::GreaterEqual,
        Token::Lt => Comparator::Less,
        Token::Le => Comparator::LessEqual,
        Token::EqEq => Comparator::Equal,
        Token::NotEqual => Comparator::NotEqual,
        _ => return Err(parser.error("expected comparison operator (>, >=, <, <=, ==, !=)")),
    };
    parser.advance();

    let threshold = parser.parse_signed_number()?;
    parser.expect_eof()?;

    Ok(Condition {
        expr,
        comparator,
        threshold,
    })
}

/// 解析不带比较的表达式
pub fn parse_expr(input: &str) -> Result<Expr> {
    let mut parser = Parser::new(input)?;
    let expr = parser.parse_expr(1)?;
    parser.expect_eof()?;
    Ok(expr)
}

/// 解析匹配器列表，如 `severity="critical", service=~"api|web"`，外层花括号可省略
pub fn parse_matchers(input: &str) -> Result<Vec<LabelMatcher>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let wrapped = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        format!("{{{}}}", trimmed)
    };

    let mut parser = Parser::new(&wrapped)?;
    let selector = parser.parse_selector(None)?;
    parser.expect_eof()?;
    Ok(selector.matchers)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn current(&self) -> &Spanned {
        // 词法结果至少包含 Eof，且 advance 不会越过它
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn offset(&self) -> usize {
        self.current().offset
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> AblageError {
        AblageError::Parse {
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn expect_eof(&self) -> Result<()> {
        match self.peek() {
            Token::Eof => Ok(()),
            other => Err(self.error(format!("unexpected trailing token {:?}", other))),
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(self.error(format!("expected identifier, found {:?}", other))),
        }
    }

    fn parse_signed_number(&mut self) -> Result<f64> {
        let negative = if *self.peek() == Token::Minus {
            self.advance();
            true
        } else {
            false
        };
        match self.advance() {
            Token::Number(value) => Ok(if negative { -value } else { value }),
            other => Err(self.error(format!("expected number, found {:?}", other))),
        }
    }

    fn peek_arith(&self) -> Option<ArithOp> {
        match self.peek() {
            Token::Plus => Some(ArithOp::Add),
            Token::Minus => Some(ArithOp::Sub),
            Token::Star => Some(ArithOp::Mul),
            Token::Slash => Some(ArithOp::Div),
            _ => None,
        }
    }

    /// 优先级爬升，同级左结合
    fn parse_expr(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;

        while let Some(op) = self.peek_arith() {
            if op.precedence() < min_precedence {
                break;
            }
            self.advance();
            let rhs = self.parse_expr(op.precedence() + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if *self.peek() == Token::Minus {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(match operand {
                Expr::Number(value) => Expr::Number(-value),
                other => Expr::Binary {
                    op: ArithOp::Mul,
                    lhs: Box::new(Expr::Number(-1.0)),
                    rhs: Box::new(other),
                },
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.peek().clone() {
            Token::Number(value) => {
                self.advance();
                Ok(Expr::Number(value))
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr(1)?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBrace => {
                let selector = self.parse_selector(None)?;
                self.reject_range()?;
                Ok(Expr::Selector(selector))
            }
            Token::Ident(name) => {
                self.advance();
                if let Some(op) = AggregateOp::from_name(&name) {
                    if matches!(self.peek(), Token::LParen)
                        || matches!(self.peek(), Token::Ident(k) if k == "by")
                    {
                        return self.parse_aggregate(op);
                    }
                }
                if *self.peek() == Token::LParen {
                    return self.parse_call(&name);
                }
                let selector = self.parse_selector(Some(name))?;
                self.reject_range()?;
                Ok(Expr::Selector(selector))
            }
            other => Err(self.error(format!("unexpected token {:?}", other))),
        }
    }

    fn reject_range(&self) -> Result<()> {
        if matches!(self.peek(), Token::Range(_)) {
            return Err(self.error("range vector is only allowed as a function argument"));
        }
        Ok(())
    }

    /// `sum by (a, b) (expr)` 或 `sum (expr) by (a, b)`
    fn parse_aggregate(&mut self, op: AggregateOp) -> Result<Expr> {
        let mut by = self.parse_by_clause()?;

        self.expect(Token::LParen, "'('")?;
        let expr = self.parse_expr(1)?;
        self.expect(Token::RParen, "')'")?;

        if by.is_empty() {
            by = self.parse_by_clause()?;
        }

        Ok(Expr::Aggregate {
            op,
            by,
            expr: Box::new(expr),
        })
    }

    fn parse_by_clause(&mut self) -> Result<Vec<String>> {
        if !matches!(self.peek(), Token::Ident(k) if k == "by") {
            return Ok(Vec::new());
        }
        self.advance();
        self.expect(Token::LParen, "'(' after by")?;

        let mut labels = Vec::new();
        while *self.peek() != Token::RParen {
            labels.push(self.expect_ident()?);
            if *self.peek() == Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(Token::RParen, "')'")?;
        Ok(labels)
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr> {
        self.expect(Token::LParen, "'('")?;

        let expr = if let Some(func) = RangeFunction::from_name(name) {
            let metric = match self.peek().clone() {
                Token::Ident(metric) => {
                    self.advance();
                    Some(metric)
                }
                Token::LBrace => None,
                other => {
                    return Err(self.error(format!(
                        "{} expects a range selector, found {:?}",
                        name, other
                    )))
                }
            };
            let selector = self.parse_selector(metric)?;
            let window = self.parse_range(name)?;
            Expr::RangeCall {
                func,
                selector,
                window,
            }
        } else {
            match name {
                "histogram_quantile" => {
                    let quantile = self.parse_signed_number()?;
                    self.expect(Token::Comma, "','")?;
                    let expr = self.parse_expr(1)?;
                    Expr::HistogramQuantile {
                        quantile,
                        expr: Box::new(expr),
                    }
                }
                "abs" => Expr::Abs(Box::new(self.parse_expr(1)?)),
                "burn_rate" => {
                    let expr = self.parse_expr(1)?;
                    self.expect(Token::Comma, "','")?;
                    let target = self.parse_signed_number()?;
                    Expr::BurnRate {
                        expr: Box::new(expr),
                        target,
                    }
                }
                other => return Err(self.error(format!("unknown function '{}'", other))),
            }
        };

        self.expect(Token::RParen, "')'")?;
        Ok(expr)
    }

    fn parse_range(&mut self, func: &str) -> Result<Duration> {
        match self.advance() {
            Token::Range(window) => Ok(window),
            other => Err(self.error(format!(
                "{} expects a range like [5m], found {:?}",
                func, other
            ))),
        }
    }

    fn parse_selector(&mut self, metric: Option<String>) -> Result<Selector> {
        let mut selector = Selector {
            metric,
            matchers: Vec::new(),
        };

        if *self.peek() != Token::LBrace {
            return Ok(selector);
        }
        self.advance();

        while *self.peek() != Token::RBrace {
            let name = self.expect_ident()?;
            let op = match self.advance() {
                Token::Assign => MatchOp::Equal,
                Token::NotEqual => MatchOp::NotEqual,
                Token::RegexMatch => MatchOp::Regex,
                Token::RegexNotMatch => MatchOp::NotRegex,
                other => {
                    return Err(self.error(format!("expected matcher operator, found {:?}", other)))
                }
            };
            let value = match self.advance() {
                Token::Str(value) => value,
                other => return Err(self.error(format!("expected quoted value, found {:?}", other))),
            };
            let matcher = LabelMatcher::new(name, op, value).map_err(|e| self.error(e.to_string()))?;
            selector.matchers.push(matcher);

            if *self.peek() == Token::Comma {
                self.advance();
            } else {
                break;
            }
        }

        self.expect(Token::RBrace, "'}'")?;

        if selector.metric.is_none() && selector.matchers.is_empty() {
            return Err(self.error("selector needs a metric name or at least one matcher"));
        }
        Ok(selector)
    }
}
