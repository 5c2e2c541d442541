//! Recursive descent parser producing the query AST
//!
//! Precedence, lowest first: `|`, `,`, `//`, `or`, `and`, comparisons,
//! `+`/`-`, `*`/`/`, then postfix suffixes (`.name`, `[..]`, `?`).

use serde_json::Value;

use super::lexer::{tokenize, Token};

/// Binary comparison operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Key of an object construction entry
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKey {
    /// `{name: …}` or `{"name": …}`
    Literal(String),
    /// `{(expr): …}`
    Computed(Expr),
}

/// Query expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Identity,
    Literal(Value),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Slice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    Iterate(Box<Expr>),
    Optional(Box<Expr>),
    Pipe(Box<Expr>, Box<Expr>),
    Comma(Box<Expr>, Box<Expr>),
    Alternative(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Array(Option<Box<Expr>>),
    Object(Vec<(ObjectKey, Option<Expr>)>),
    Try(Box<Expr>, Option<Box<Expr>>),
    If(Vec<(Expr, Expr)>, Option<Box<Expr>>),
    Call(String, Vec<Expr>),
}

/// Parse query text into an expression
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("query is empty".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.pipe()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected '{}' after end of expression", token)),
    }
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<Token<'a>> {
        self.tokens.get(self.pos + offset).copied()
    }

    fn next(&mut self) -> Option<Token<'a>> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: Token<'_>) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek() == Some(Token::Ident(keyword)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token<'_>) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected '{}' but found '{}'", expected, token)),
            None => Err(format!("expected '{}' but the query ended", expected)),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), String> {
        self.expect(Token::Ident(keyword))
    }

    fn pipe(&mut self) -> Result<Expr, String> {
        let left = self.comma()?;
        if self.eat(Token::Pipe) {
            let right = self.pipe()?;
            return Ok(Expr::Pipe(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn comma(&mut self) -> Result<Expr, String> {
        let mut left = self.alternative()?;
        while self.eat(Token::Comma) {
            let right = self.alternative()?;
            left = Expr::Comma(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn alternative(&mut self) -> Result<Expr, String> {
        let left = self.or()?;
        if self.eat(Token::Alternative) {
            let right = self.alternative()?;
            return Ok(Expr::Alternative(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.comparison()?;
        while self.eat_keyword("and") {
            let right = self.comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.postfix()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.postfix()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => match self.peek_at(1) {
                    Some(Token::Ident(name)) => {
                        self.pos += 2;
                        expr = Expr::Field(Box::new(expr), name.to_string());
                    }
                    Some(Token::Str(raw)) => {
                        self.pos += 2;
                        expr = Expr::Field(Box::new(expr), unquote(raw)?);
                    }
                    Some(Token::LBracket) => {
                        self.pos += 1;
                    }
                    _ => return Ok(expr),
                },
                Some(Token::LBracket) => {
                    self.pos += 1;
                    expr = self.bracket_suffix(expr)?;
                }
                Some(Token::Question) => {
                    self.pos += 1;
                    expr = Expr::Optional(Box::new(expr));
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Parse what follows `[` in a suffix position: `]`, `expr]`,
    /// `expr:expr]`, `:expr]` or `expr:]`.
    fn bracket_suffix(&mut self, target: Expr) -> Result<Expr, String> {
        if self.eat(Token::RBracket) {
            return Ok(Expr::Iterate(Box::new(target)));
        }
        if self.eat(Token::Colon) {
            let to = self.pipe()?;
            self.expect(Token::RBracket)?;
            return Ok(Expr::Slice(Box::new(target), None, Some(Box::new(to))));
        }
        let index = self.pipe()?;
        if self.eat(Token::Colon) {
            if self.eat(Token::RBracket) {
                return Ok(Expr::Slice(Box::new(target), Some(Box::new(index)), None));
            }
            let to = self.pipe()?;
            self.expect(Token::RBracket)?;
            return Ok(Expr::Slice(
                Box::new(target),
                Some(Box::new(index)),
                Some(Box::new(to)),
            ));
        }
        self.expect(Token::RBracket)?;
        Ok(Expr::Index(Box::new(target), Box::new(index)))
    }

    fn primary(&mut self) -> Result<Expr, String> {
        let token = match self.next() {
            Some(token) => token,
            None => return Err("unexpected end of query".to_string()),
        };
        match token {
            Token::Dot => match self.peek() {
                Some(Token::Ident(name)) => {
                    self.pos += 1;
                    Ok(Expr::Field(Box::new(Expr::Identity), name.to_string()))
                }
                Some(Token::Str(raw)) => {
                    self.pos += 1;
                    Ok(Expr::Field(Box::new(Expr::Identity), unquote(raw)?))
                }
                _ => Ok(Expr::Identity),
            },
            Token::Number(text) => text
                .parse::<f64>()
                .ok()
                .and_then(number)
                .map(Expr::Literal)
                .ok_or_else(|| format!("invalid number '{}'", text)),
            Token::Str(raw) => Ok(Expr::Literal(Value::String(unquote(raw)?))),
            Token::Minus => {
                let operand = self.postfix()?;
                Ok(Expr::Neg(Box::new(operand)))
            }
            Token::LParen => {
                let inner = self.pipe()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                if self.eat(Token::RBracket) {
                    return Ok(Expr::Array(None));
                }
                let inner = self.pipe()?;
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(Some(Box::new(inner))))
            }
            Token::LBrace => self.object(),
            Token::Ident(word) => self.word(word),
            other => Err(format!("unexpected '{}'", other)),
        }
    }

    fn word(&mut self, word: &str) -> Result<Expr, String> {
        match word {
            "true" => Ok(Expr::Literal(Value::Bool(true))),
            "false" => Ok(Expr::Literal(Value::Bool(false))),
            "null" => Ok(Expr::Literal(Value::Null)),
            "try" => {
                let body = self.postfix()?;
                let handler = if self.eat_keyword("catch") {
                    Some(Box::new(self.postfix()?))
                } else {
                    None
                };
                Ok(Expr::Try(Box::new(body), handler))
            }
            "if" => self.conditional(),
            "and" | "or" | "then" | "elif" | "else" | "end" | "catch" => {
                Err(format!("unexpected keyword '{}'", word))
            }
            name => {
                let mut args = Vec::new();
                if self.eat(Token::LParen) {
                    loop {
                        args.push(self.pipe()?);
                        if self.eat(Token::Semicolon) {
                            continue;
                        }
                        self.expect(Token::RParen)?;
                        break;
                    }
                }
                Ok(Expr::Call(name.to_string(), args))
            }
        }
    }

    fn conditional(&mut self) -> Result<Expr, String> {
        let mut branches = Vec::new();
        loop {
            let condition = self.pipe()?;
            self.expect_keyword("then")?;
            let body = self.pipe()?;
            branches.push((condition, body));
            if self.eat_keyword("elif") {
                continue;
            }
            break;
        }
        let otherwise = if self.eat_keyword("else") {
            Some(Box::new(self.pipe()?))
        } else {
            None
        };
        self.expect_keyword("end")?;
        Ok(Expr::If(branches, otherwise))
    }

    fn object(&mut self) -> Result<Expr, String> {
        let mut entries = Vec::new();
        if self.eat(Token::RBrace) {
            return Ok(Expr::Object(entries));
        }
        loop {
            let key = match self.next() {
                Some(Token::Ident(name)) => ObjectKey::Literal(name.to_string()),
                Some(Token::Str(raw)) => ObjectKey::Literal(unquote(raw)?),
                Some(Token::LParen) => {
                    let expr = self.pipe()?;
                    self.expect(Token::RParen)?;
                    ObjectKey::Computed(expr)
                }
                Some(token) => return Err(format!("unexpected '{}' in object key", token)),
                None => return Err("unexpected end of query in object".to_string()),
            };
            let value = if self.eat(Token::Colon) {
                Some(self.alternative()?)
            } else {
                None
            };
            if value.is_none() && matches!(key, ObjectKey::Computed(_)) {
                return Err("computed object keys need a value".to_string());
            }
            entries.push((key, value));
            if self.eat(Token::Comma) {
                continue;
            }
            self.expect(Token::RBrace)?;
            return Ok(Expr::Object(entries));
        }
    }
}

fn unquote(raw: &str) -> Result<String, String> {
    serde_json::from_str::<String>(raw).map_err(|e| format!("invalid string {}: {}", raw, e))
}

/// Convert a float to a JSON number, keeping integral values as integers
pub(crate) fn number(value: f64) -> Option<Value> {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(Value::from(value as i64))
    } else {
        serde_json::Number::from_f64(value).map(Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(target: Expr, name: &str) -> Expr {
        Expr::Field(Box::new(target), name.to_string())
    }

    #[test]
    fn test_path_chain() {
        assert_eq!(
            parse(".status.domain").unwrap(),
            field(field(Expr::Identity, "status"), "domain")
        );
        assert_eq!(
            parse(".items[0]").unwrap(),
            Expr::Index(
                Box::new(field(Expr::Identity, "items")),
                Box::new(Expr::Literal(Value::from(0)))
            )
        );
    }

    #[test]
    fn test_pipe_binds_looser_than_comma() {
        match parse(".a, .b | .c").unwrap() {
            Expr::Pipe(left, _) => assert!(matches!(*left, Expr::Comma(_, _))),
            other => panic!("expected pipe, got {:?}", other),
        }
    }

    #[test]
    fn test_try_with_optional_iteration() {
        let expr = parse("try .status.conditions[]? | .status").unwrap();
        match expr {
            Expr::Pipe(left, _) => match *left {
                Expr::Try(body, None) => assert!(matches!(*body, Expr::Optional(_))),
                other => panic!("expected try, got {:?}", other),
            },
            other => panic!("expected pipe, got {:?}", other),
        }
    }

    #[test]
    fn test_object_construction_forms() {
        let expr = parse(r#"{ "mac": .macAddress, ip: .ipV4Addresses[0], name }"#).unwrap();
        match expr {
            Expr::Object(entries) => {
                assert_eq!(entries.len(), 3);
                assert_eq!(entries[0].0, ObjectKey::Literal("mac".to_string()));
                assert!(entries[2].1.is_none());
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("").is_err());
        assert!(parse(".a[").is_err());
        assert!(parse("select(.a").is_err());
        assert!(parse("if .a then .b").is_err());
        assert!(parse(".a )").unwrap_err().contains("after end"));
    }
}
