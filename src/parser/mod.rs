//! Hand-written SQL tokenizer/parser. A full-dialect parser crate would be
//! overkill for this engine's small, fixed statement grammar, so this module
//! is a small hand-rolled lexer plus a recursive-descent parser producing one
//! `Statement` variant per supported statement kind.

use crate::catalog::{CmpOp, FieldType, Joiner, WhereClause};
use crate::error::{EngineError, Result};
use crate::vm::IsolationLevel;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Symbol(char),
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            let mut s = String::new();
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                s.push(chars[i]);
                i += 1;
            }
            if i >= chars.len() {
                return Err(EngineError::InvalidCommand("unterminated string literal".into()));
            }
            i += 1;
            tokens.push(Token::Str(s));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<i64>()
                .map_err(|_| EngineError::InvalidCommand(format!("bad integer literal: {text}")))?;
            tokens.push(Token::Int(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if matches!(c, '(' | ')' | ',' | '*' | '=' | '<' | '>') {
            tokens.push(Token::Symbol(c));
            i += 1;
        } else {
            return Err(EngineError::InvalidCommand(format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
pub enum Literal {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone)]
pub enum Statement {
    Begin { isolation: Option<IsolationLevel> },
    Commit,
    Abort,
    Show,
    CreateTable {
        name: String,
        fields: Vec<(String, FieldType)>,
        indexed: Vec<String>,
    },
    DropTable {
        name: String,
    },
    Select {
        table: String,
        fields: Option<Vec<String>>,
        where_clause: Option<WhereClause>,
    },
    Insert {
        table: String,
        values: Vec<Literal>,
    },
    Update {
        table: String,
        field: String,
        value: Literal,
        where_clause: Option<WhereClause>,
    },
    Delete {
        table: String,
        where_clause: Option<WhereClause>,
    },
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s.clone()),
            other => Err(EngineError::InvalidCommand(format!("expected identifier, got {other:?}"))),
        }
    }

    fn expect_symbol(&mut self, sym: char) -> Result<()> {
        match self.next() {
            Some(Token::Symbol(c)) if *c == sym => Ok(()),
            other => Err(EngineError::InvalidCommand(format!("expected '{sym}', got {other:?}"))),
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(EngineError::InvalidCommand(format!("expected keyword '{kw}'")))
        }
    }
}

/// Parses one SQL statement (no trailing semicolon, no multi-statement
/// batches — the wire protocol frames one statement per request).
pub fn parse(sql: &str) -> Result<Statement> {
    let tokens = tokenize(sql.trim())?;
    let mut cur = Cursor { tokens: &tokens, pos: 0 };
    let keyword = match cur.peek() {
        Some(Token::Ident(s)) => s.to_ascii_lowercase(),
        _ => return Err(EngineError::InvalidCommand("empty statement".into())),
    };

    match keyword.as_str() {
        "begin" => {
            cur.pos += 1;
            let isolation = if cur.eat_keyword("read") {
                cur.expect_keyword("committed")?;
                Some(IsolationLevel::ReadCommitted)
            } else if cur.eat_keyword("repeatable") {
                cur.expect_keyword("read")?;
                Some(IsolationLevel::RepeatableRead)
            } else {
                None
            };
            Ok(Statement::Begin { isolation })
        }
        "commit" => Ok(Statement::Commit),
        "abort" => Ok(Statement::Abort),
        "show" => Ok(Statement::Show),
        "create" => {
            cur.pos += 1;
            cur.expect_keyword("table")?;
            parse_create_table(&mut cur)
        }
        "drop" => {
            cur.pos += 1;
            cur.expect_keyword("table")?;
            let name = cur.expect_ident()?;
            Ok(Statement::DropTable { name })
        }
        "select" => {
            cur.pos += 1;
            parse_select(&mut cur)
        }
        "insert" => {
            cur.pos += 1;
            cur.expect_keyword("into")?;
            parse_insert(&mut cur)
        }
        "update" => {
            cur.pos += 1;
            parse_update(&mut cur)
        }
        "delete" => {
            cur.pos += 1;
            cur.expect_keyword("from")?;
            parse_delete(&mut cur)
        }
        other => Err(EngineError::InvalidCommand(format!("unknown statement '{other}'"))),
    }
}

fn parse_field_type(cur: &mut Cursor) -> Result<FieldType> {
    let ty = cur.expect_ident()?;
    match ty.to_ascii_lowercase().as_str() {
        "int32" => Ok(FieldType::Int32),
        "int64" => Ok(FieldType::Int64),
        "string" => Ok(FieldType::Str),
        other => Err(EngineError::InvalidField(other.to_string())),
    }
}

fn parse_create_table(cur: &mut Cursor) -> Result<Statement> {
    let name = cur.expect_ident()?;
    cur.expect_symbol('(')?;
    let mut fields = Vec::new();
    loop {
        let fname = cur.expect_ident()?;
        let fty = parse_field_type(cur)?;
        fields.push((fname, fty));
        if let Some(Token::Symbol(',')) = cur.peek() {
            cur.pos += 1;
            continue;
        }
        break;
    }
    cur.expect_symbol(')')?;

    let mut indexed = Vec::new();
    if cur.eat_keyword("index") {
        while let Some(Token::Ident(name)) = cur.peek() {
            indexed.push(name.clone());
            cur.pos += 1;
        }
    }
    Ok(Statement::CreateTable { name, fields, indexed })
}

fn parse_where(cur: &mut Cursor) -> Result<Option<WhereClause>> {
    if !cur.eat_keyword("where") {
        return Ok(None);
    }
    Ok(Some(parse_where_term(cur)?))
}

fn parse_where_term(cur: &mut Cursor) -> Result<WhereClause> {
    let field = cur.expect_ident()?;
    let op = match cur.next() {
        Some(Token::Symbol('=')) => CmpOp::Eq,
        Some(Token::Symbol('<')) => CmpOp::Lt,
        Some(Token::Symbol('>')) => CmpOp::Gt,
        other => return Err(EngineError::InvalidCommand(format!("expected comparison operator, got {other:?}"))),
    };
    let value = parse_value(cur)?;

    let and_or = if cur.eat_keyword("and") {
        Some((Joiner::And, Box::new(parse_where_term(cur)?)))
    } else if cur.eat_keyword("or") {
        Some((Joiner::Or, Box::new(parse_where_term(cur)?)))
    } else {
        None
    };

    Ok(WhereClause { field, op, value, and_or })
}

fn parse_value(cur: &mut Cursor) -> Result<crate::catalog::Value> {
    match cur.next() {
        Some(Token::Int(n)) => Ok(crate::catalog::Value::Int64(*n)),
        Some(Token::Str(s)) => Ok(crate::catalog::Value::Str(s.clone())),
        other => Err(EngineError::InvalidCommand(format!("expected literal, got {other:?}"))),
    }
}

fn parse_literal(cur: &mut Cursor) -> Result<Literal> {
    match cur.next() {
        Some(Token::Int(n)) => Ok(Literal::Int(*n)),
        Some(Token::Str(s)) => Ok(Literal::Str(s.clone())),
        other => Err(EngineError::InvalidCommand(format!("expected literal, got {other:?}"))),
    }
}

fn parse_select(cur: &mut Cursor) -> Result<Statement> {
    let fields = if let Some(Token::Symbol('*')) = cur.peek() {
        cur.pos += 1;
        None
    } else {
        let mut names = vec![cur.expect_ident()?];
        while let Some(Token::Symbol(',')) = cur.peek() {
            cur.pos += 1;
            names.push(cur.expect_ident()?);
        }
        Some(names)
    };
    cur.expect_keyword("from")?;
    let table = cur.expect_ident()?;
    let where_clause = parse_where(cur)?;
    Ok(Statement::Select { table, fields, where_clause })
}

fn parse_insert(cur: &mut Cursor) -> Result<Statement> {
    let table = cur.expect_ident()?;
    cur.expect_keyword("values")?;
    let mut values = vec![parse_literal(cur)?];
    while let Some(Token::Symbol(',')) = cur.peek() {
        cur.pos += 1;
        values.push(parse_literal(cur)?);
    }
    Ok(Statement::Insert { table, values })
}

fn parse_update(cur: &mut Cursor) -> Result<Statement> {
    let table = cur.expect_ident()?;
    cur.expect_keyword("set")?;
    let field = cur.expect_ident()?;
    cur.expect_symbol('=')?;
    let value = parse_literal(cur)?;
    let where_clause = parse_where(cur)?;
    Ok(Statement::Update { table, field, value, where_clause })
}

fn parse_delete(cur: &mut Cursor) -> Result<Statement> {
    let table = cur.expect_ident()?;
    let where_clause = parse_where(cur)?;
    Ok(Statement::Delete { table, where_clause })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_table_with_index() {
        let stmt = parse("create table users (id int64 name string) index id").unwrap();
        match stmt {
            Statement::CreateTable { name, fields, indexed } => {
                assert_eq!(name, "users");
                assert_eq!(fields.len(), 2);
                assert_eq!(indexed, vec!["id".to_string()]);
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn parses_select_with_where_and() {
        let stmt = parse("select * from users where id = 1 and name = 'bob'").unwrap();
        match stmt {
            Statement::Select { table, fields, where_clause } => {
                assert_eq!(table, "users");
                assert!(fields.is_none());
                let w = where_clause.unwrap();
                assert_eq!(w.field, "id");
                assert!(w.and_or.is_some());
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn parses_begin_with_isolation() {
        match parse("begin repeatable read").unwrap() {
            Statement::Begin { isolation: Some(IsolationLevel::RepeatableRead) } => {}
            other => panic!("unexpected statement: {other:?}"),
        }
        match parse("begin").unwrap() {
            Statement::Begin { isolation: None } => {}
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn parses_insert_and_update() {
        match parse("insert into users values 1, 'bob'").unwrap() {
            Statement::Insert { table, values } => {
                assert_eq!(table, "users");
                assert_eq!(values.len(), 2);
            }
            other => panic!("unexpected statement: {other:?}"),
        }
        match parse("update users set name = 'carol' where id = 1").unwrap() {
            Statement::Update { table, field, .. } => {
                assert_eq!(table, "users");
                assert_eq!(field, "name");
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }
}
