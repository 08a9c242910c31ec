use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::model::{EventTable, Value};
use crate::error::{CytoError, Result};

// ---------------------------------------------------------------------------
// Predicate – a typed row filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// A row predicate over named columns.
///
/// Built directly or parsed from a restricted expression language, e.g.
/// `` Dox >= 1 and (Sample == 'A' or `Y2-A` > 2000) ``.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// The row's value is one of the selected values.
    OneOf {
        field: String,
        values: BTreeSet<Value>,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::OneOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Parse the restricted expression language.
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let pred = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(CytoError::Expression(format!(
                "unexpected {tok:?} after end of expression"
            )));
        }
        Ok(pred)
    }

    /// Every column name the predicate refers to.
    pub fn fields(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Compare { field, .. } | Predicate::OneOf { field, .. } => {
                out.insert(field.as_str());
            }
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_fields(out);
                b.collect_fields(out);
            }
            Predicate::Not(p) => p.collect_fields(out),
        }
    }

    /// Evaluate against one row. Missing columns never match.
    pub fn matches(&self, table: &EventTable, row: usize) -> bool {
        match self {
            Predicate::Compare { field, op, value } => table
                .value(row, field)
                .map(|cell| compare(&cell, *op, value))
                .unwrap_or(false),
            Predicate::OneOf { field, values } => table
                .value(row, field)
                .map(|cell| {
                    values.contains(&cell)
                        || values.iter().any(|v| compare(&cell, CompareOp::Eq, v))
                })
                .unwrap_or(false),
            Predicate::And(a, b) => a.matches(table, row) && b.matches(table, row),
            Predicate::Or(a, b) => a.matches(table, row) || b.matches(table, row),
            Predicate::Not(p) => !p.matches(table, row),
        }
    }
}

/// Compare a cell against a literal. Ints and floats compare numerically;
/// values of incompatible types never match.
fn compare(cell: &Value, op: CompareOp, literal: &Value) -> bool {
    let ordering = match (cell, literal) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => match (cell.as_f64(), literal.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let Some(ord) = ordering else {
        return false;
    };
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

// ---------------------------------------------------------------------------
// Row selection
// ---------------------------------------------------------------------------

/// Return indices of rows passing `predicate`, in table order.
///
/// Fails when the predicate names a column the table does not have, so a
/// typo in a subset expression is an error rather than an empty selection.
pub fn filtered_indices(table: &EventTable, predicate: &Predicate) -> Result<Vec<usize>> {
    let unknown: Vec<&str> = predicate
        .fields()
        .into_iter()
        .filter(|f| !table.contains(f))
        .collect();
    if !unknown.is_empty() {
        return Err(CytoError::Expression(format!(
            "unknown column(s): {}",
            unknown.join(", ")
        )));
    }
    Ok((0..table.len())
        .filter(|&row| predicate.matches(table, row))
        .collect())
}

// ---------------------------------------------------------------------------
// Tokenizer / parser for the expression language
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64, bool),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CompareOp::Eq, 2),
                    ('!', Some('=')) => (CompareOp::Ne, 2),
                    ('<', Some('=')) => (CompareOp::Le, 2),
                    ('>', Some('=')) => (CompareOp::Ge, 2),
                    ('<', _) => (CompareOp::Lt, 1),
                    ('>', _) => (CompareOp::Gt, 1),
                    _ => {
                        return Err(CytoError::Expression(format!(
                            "unexpected '{c}' at position {i}"
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' | '"' | '`' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| {
                        CytoError::Expression(format!("unterminated quote at position {i}"))
                    })?;
                let text: String = chars[i + 1..i + 1 + close].iter().collect();
                tokens.push(if c == '`' {
                    Token::Ident(text)
                } else {
                    Token::Str(text)
                });
                i += close + 2;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-'))
                {
                    // Only allow a sign right after an exponent marker.
                    if matches!(chars[i], '+' | '-') && !matches!(chars[i - 1], 'e' | 'E') {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| {
                    CytoError::Expression(format!("'{text}' is not a number"))
                })?;
                let integral = !text.contains(['.', 'e', 'E']);
                tokens.push(Token::Number(value, integral));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(CytoError::Expression(format!(
                    "unexpected '{other}' at position {i}"
                )))
            }
        }
    }
    Ok(tokens)
}

/// Deepest `not` / parenthesis nesting the parser accepts.
const MAX_NESTING: usize = 64;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Current `not` / parenthesis nesting.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(CytoError::Expression(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Predicate> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = left.or(right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("and") {
            let right = self.parse_unary()?;
            left = left.and(right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Predicate> {
        if self.eat_keyword("not") {
            return self.nested(|p| Ok(p.parse_unary()?.negate()));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            return self.nested(|p| {
                let inner = p.parse_or()?;
                p.expect(Token::RParen)?;
                Ok(inner)
            });
        }
        self.parse_comparison()
    }

    fn nested(&mut self, f: impl FnOnce(&mut Self) -> Result<Predicate>) -> Result<Predicate> {
        if self.depth >= MAX_NESTING {
            return Err(CytoError::Expression(format!(
                "expression nests deeper than {MAX_NESTING} levels"
            )));
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn parse_comparison(&mut self) -> Result<Predicate> {
        let field = match self.next() {
            Some(Token::Ident(name)) => name,
            other => {
                return Err(CytoError::Expression(format!(
                    "expected a column name, found {other:?}"
                )))
            }
        };

        if self.eat_keyword("in") {
            self.expect(Token::LParen)?;
            let mut values = BTreeSet::new();
            loop {
                values.insert(self.parse_literal()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    other => {
                        return Err(CytoError::Expression(format!(
                            "expected ',' or ')', found {other:?}"
                        )))
                    }
                }
            }
            return Ok(Predicate::OneOf { field, values });
        }

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(CytoError::Expression(format!(
                    "expected a comparison after '{field}', found {other:?}"
                )))
            }
        };
        let value = self.parse_literal()?;
        Ok(Predicate::Compare { field, op, value })
    }

    fn parse_literal(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Number(v, true)) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                Ok(Value::Integer(v as i64))
            }
            Some(Token::Number(v, _)) => Ok(Value::Float(v)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            other => Err(CytoError::Expression(format!(
                "expected a literal, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::Column;

    fn table() -> EventTable {
        let mut t = EventTable::default();
        t.append_rows(vec![
            ("Y2-A".to_string(), Column::Float(vec![100.0, 2500.0, 3000.0])),
            ("Dox".to_string(), Column::Float(vec![1.0, 10.0, 10.0])),
            (
                "Sample".to_string(),
                Column::Str(vec!["A".into(), "A".into(), "B".into()]),
            ),
        ])
        .unwrap();
        t
    }

    #[test]
    fn parses_precedence_and_before_or() {
        let p = Predicate::parse("Dox == 1 or Dox == 10 and Sample == 'B'").unwrap();
        let expected = Predicate::compare("Dox", CompareOp::Eq, 1i64).or(
            Predicate::compare("Dox", CompareOp::Eq, 10i64).and(Predicate::compare(
                "Sample",
                CompareOp::Eq,
                "B",
            )),
        );
        assert_eq!(p, expected);
    }

    #[test]
    fn backtick_fields_and_numeric_widening() {
        let t = table();
        let p = Predicate::parse("`Y2-A` > 2000 and Dox >= 10").unwrap();
        assert_eq!(filtered_indices(&t, &p).unwrap(), vec![1, 2]);
    }

    #[test]
    fn in_lists_and_negation() {
        let t = table();
        let p = Predicate::parse("not Sample in ('B', 'C')").unwrap();
        assert_eq!(filtered_indices(&t, &p).unwrap(), vec![0, 1]);
    }

    #[test]
    fn mismatched_types_never_match() {
        let t = table();
        let p = Predicate::parse("Sample > 3").unwrap();
        assert!(filtered_indices(&t, &p).unwrap().is_empty());
    }

    #[test]
    fn unknown_columns_are_errors() {
        let t = table();
        let p = Predicate::parse("Tube == 'A'").unwrap();
        assert!(matches!(
            filtered_indices(&t, &p),
            Err(CytoError::Expression(_))
        ));
    }

    #[test]
    fn rejects_code_like_input() {
        for bad in ["__import__('os')", "Dox = 1", "Dox == ", "(Dox == 1", "Dox == 1 1"] {
            assert!(Predicate::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn negative_and_exponent_literals() {
        let p = Predicate::parse("Dox > -1.5e2").unwrap();
        assert_eq!(p, Predicate::compare("Dox", CompareOp::Gt, -150.0));
    }

    #[test]
    fn nesting_is_bounded() {
        let parens = format!("{}Dox == 1{}", "(".repeat(1000), ")".repeat(1000));
        let nots = format!("{}Dox == 1", "not ".repeat(1000));
        for deep in [parens, nots] {
            assert!(matches!(
                Predicate::parse(&deep),
                Err(CytoError::Expression(_))
            ));
        }

        let shallow = format!("{}Dox == 1{}", "(not ".repeat(20), ")".repeat(20));
        let expected =
            (0..20).fold(Predicate::compare("Dox", CompareOp::Eq, 1i64), |p, _| p.negate());
        assert_eq!(Predicate::parse(&shallow).unwrap(), expected);
    }
}
