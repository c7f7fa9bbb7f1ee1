//! Expression language for computed columns.
//!
//! `create_column` accepts a small arithmetic/comparison expression evaluated
//! against existing columns: numeric literals, column names as variables,
//! `+ - * / %`, comparisons `> < >= <= == !=`, unary minus, and parentheses.
//! Expressions are parsed into an AST and lowered to Polars lazy expressions,
//! so evaluation happens columnwise inside the query engine.

use crate::{AlchemistError, Result};
use polars::prelude::{col, lit, Expr};

/// Binary operators in increasing precedence order: comparisons bind loosest,
/// then additive, then multiplicative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    fn precedence(self) -> u8 {
        match self {
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => 1,
            BinOp::Add | BinOp::Sub => 2,
            BinOp::Mul | BinOp::Div | BinOp::Rem => 3,
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    Number(f64),
    Column(String),
    Neg(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
}

impl Ast {
    /// Collect every column name referenced by the expression.
    pub fn columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut Vec<String>) {
        match self {
            Ast::Number(_) => {}
            Ast::Column(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Ast::Neg(inner) => inner.collect_columns(out),
            Ast::Binary(_, left, right) => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
        }
    }

    /// Lower the AST to a Polars lazy expression.
    pub fn to_polars(&self) -> Expr {
        match self {
            Ast::Number(v) => lit(*v),
            Ast::Column(name) => col(name.as_str()),
            Ast::Neg(inner) => -inner.to_polars(),
            Ast::Binary(op, left, right) => {
                let l = left.to_polars();
                let r = right.to_polars();
                match op {
                    BinOp::Eq => l.eq(r),
                    BinOp::NotEq => l.neq(r),
                    BinOp::Lt => l.lt(r),
                    BinOp::LtEq => l.lt_eq(r),
                    BinOp::Gt => l.gt(r),
                    BinOp::GtEq => l.gt_eq(r),
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Rem => l % r,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(BinOp),
    Minus,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinOp::Rem));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, next_eq) {
                    ('=', true) => BinOp::Eq,
                    ('!', true) => BinOp::NotEq,
                    ('<', true) => BinOp::LtEq,
                    ('>', true) => BinOp::GtEq,
                    ('<', false) => BinOp::Lt,
                    ('>', false) => BinOp::Gt,
                    _ => {
                        return Err(AlchemistError::Parse(format!(
                            "unexpected character '{}' in expression",
                            c
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += if next_eq { 2 } else { 1 };
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| {
                    AlchemistError::Parse(format!("invalid numeric literal '{}'", text))
                })?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                return Err(AlchemistError::Parse(format!(
                    "unexpected character '{}' in expression",
                    c
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_expr(&mut self, min_prec: u8) -> Result<Ast> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => *op,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            if op.precedence() < min_prec {
                break;
            }
            self.advance();
            // Left-associative: parse the right side at one level tighter.
            let right = self.parse_expr(op.precedence() + 1)?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Ast::Neg(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.advance() {
            Some(Token::Number(v)) => Ok(Ast::Number(v)),
            Some(Token::Ident(name)) => Ok(Ast::Column(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr(1)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(AlchemistError::Parse(
                        "unbalanced parentheses in expression".to_string(),
                    )),
                }
            }
            other => Err(AlchemistError::Parse(format!(
                "unexpected token in expression: {:?}",
                other
            ))),
        }
    }
}

/// Parse an expression into its AST.
pub fn parse(input: &str) -> Result<Ast> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(AlchemistError::Parse("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr(1)?;
    if parser.pos != parser.tokens.len() {
        return Err(AlchemistError::Parse(format!(
            "trailing input after expression at token {}",
            parser.pos
        )));
    }
    Ok(ast)
}
