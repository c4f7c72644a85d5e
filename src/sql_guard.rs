//! SQL Guard - read-only checks that run before anything leaves the process
//!
//! Two layers: a lexical pass that understands quotes and comments (always
//! runs), and an AST pass via sqlparser that rejects mutating statements and
//! unknown tables. The AST pass is skipped when the generic dialect cannot
//! parse the statement; the lakehouse gets the final word in that case.

use crate::schema::SchemaDescription;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::{Expr, Query, SelectItem, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Statement keywords that are never allowed anywhere in a query.
pub const MUTATION_KEYWORDS: [&str; 11] = [
    "MODIFY", "UPDATE", "DELETE", "TRUNCATE", "DROP", "CREATE", "ALTER", "INSERT", "MERGE", "GRANT",
    "REVOKE",
];

/// Keywords a generated statement may start with.
pub const READ_KEYWORDS: [&str; 5] = ["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC"];

lazy_static! {
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("empty statement")]
    Empty,

    #[error("expected a single statement, found {0}")]
    MultipleStatements(usize),

    #[error("mutation keyword {0} is not allowed")]
    MutationKeyword(String),

    #[error("statement is not read-only: {0}")]
    MutatingStatement(String),

    #[error("unknown table {0}")]
    UnknownTable(String),
}

#[derive(Clone, Copy, PartialEq)]
enum ScanState {
    Code,
    Single,
    Double,
    Backtick,
    LineComment,
    BlockComment,
}

/// Blank out string literals, quoted identifiers and comments.
///
/// Every masked char becomes as many spaces as its UTF-8 width, so byte
/// offsets in the result line up with the input.
pub fn mask(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut state = ScanState::Code;
    let mut chars = sql.chars().peekable();

    let blank = |out: &mut String, c: char| {
        for _ in 0..c.len_utf8() {
            out.push(' ');
        }
    };

    while let Some(c) = chars.next() {
        match state {
            ScanState::Code => match c {
                '\'' => {
                    state = ScanState::Single;
                    out.push(' ');
                }
                '"' => {
                    state = ScanState::Double;
                    out.push(' ');
                }
                '`' => {
                    state = ScanState::Backtick;
                    out.push(' ');
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = ScanState::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = ScanState::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(c),
            },
            ScanState::Single | ScanState::Double | ScanState::Backtick => {
                let closing = match state {
                    ScanState::Single => '\'',
                    ScanState::Double => '"',
                    _ => '`',
                };
                if c == closing {
                    state = ScanState::Code;
                }
                blank(&mut out, c);
            }
            ScanState::LineComment => {
                if c == '\n' {
                    state = ScanState::Code;
                    out.push('\n');
                } else {
                    blank(&mut out, c);
                }
            }
            ScanState::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = ScanState::Code;
                    out.push_str("  ");
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    blank(&mut out, c);
                }
            }
        }
    }
    out
}

/// Split on `;` outside quotes and comments, dropping pieces with no code.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let masked = mask(sql);
    let mut statements = Vec::new();
    let mut start = 0;

    for (idx, _) in masked.match_indices(';') {
        if !masked[start..idx].trim().is_empty() {
            statements.push(sql[start..idx].trim());
        }
        start = idx + 1;
    }
    if !masked[start..].trim().is_empty() {
        statements.push(sql[start..].trim());
    }
    statements
}

/// Text up to and including the first `;` outside quotes and comments.
pub fn first_statement(text: &str) -> &str {
    match mask(text).find(';') {
        Some(idx) => &text[..=idx],
        None => text,
    }
}

/// First keyword of the statement, uppercased, ignoring comments and `(`.
pub fn leading_keyword(sql: &str) -> Option<String> {
    let masked = mask(sql);
    let trimmed = masked.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let offset = masked.len() - trimmed.len();
    WORD.find(trimmed)
        .filter(|m| m.start() == 0)
        .map(|m| sql[offset + m.start()..offset + m.end()].to_ascii_uppercase())
}

/// First mutation keyword appearing as a bare word outside quotes and comments.
pub fn find_mutation_keyword(sql: &str) -> Option<&'static str> {
    let masked = mask(sql);
    WORD.find_iter(&masked).find_map(|m| {
        let word = m.as_str();
        MUTATION_KEYWORDS
            .iter()
            .copied()
            .find(|kw| kw.eq_ignore_ascii_case(word))
    })
}

pub fn is_read_keyword(keyword: &str) -> bool {
    READ_KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(keyword))
}

/// Whether the generic dialect parses `sql` into real statements.
///
/// `SHOW <words>` is rejected: the parser accepts any run of words after
/// `SHOW` as a variable name, which would let prose through.
pub fn parses(sql: &str) -> bool {
    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, sql) {
        Ok(ast) => {
            !ast.is_empty()
                && !ast
                    .iter()
                    .any(|stmt| matches!(stmt, Statement::ShowVariable { .. }))
        }
        Err(_) => false,
    }
}

/// Full local check used by the executor before any network call.
pub fn check_read_only(sql: &str, schema: &SchemaDescription) -> Result<(), GuardViolation> {
    let statements = split_statements(sql);
    match statements.len() {
        0 => return Err(GuardViolation::Empty),
        1 => {}
        n => return Err(GuardViolation::MultipleStatements(n)),
    }

    if let Some(keyword) = find_mutation_keyword(sql) {
        return Err(GuardViolation::MutationKeyword(keyword.to_string()));
    }

    let dialect = GenericDialect {};
    let ast = match Parser::parse_sql(&dialect, statements[0]) {
        Ok(ast) => ast,
        Err(e) => {
            debug!("Skipping AST guard, statement did not parse: {}", e);
            return Ok(());
        }
    };

    let mut refs = TableRefs::default();
    for stmt in &ast {
        match stmt {
            Statement::Query(query) => refs.collect_query(query),
            Statement::Insert { .. }
            | Statement::Update { .. }
            | Statement::Delete { .. }
            | Statement::CreateTable { .. }
            | Statement::Drop { .. }
            | Statement::AlterTable { .. } => {
                return Err(GuardViolation::MutatingStatement(first_words(statements[0])));
            }
            _ => {}
        }
    }

    for table in &refs.tables {
        if refs.ctes.contains(&table.to_ascii_lowercase()) {
            continue;
        }
        if schema.table(table).is_none() {
            return Err(GuardViolation::UnknownTable(table.clone()));
        }
    }
    Ok(())
}

/// Tables referenced by a parseable statement, or `None` when it does not parse.
pub fn referenced_tables(sql: &str) -> Option<Vec<String>> {
    let dialect = GenericDialect {};
    let ast = Parser::parse_sql(&dialect, sql).ok()?;
    let mut refs = TableRefs::default();
    for stmt in &ast {
        if let Statement::Query(query) = stmt {
            refs.collect_query(query);
        }
    }
    Some(refs.tables)
}

fn first_words(sql: &str) -> String {
    sql.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
struct TableRefs {
    tables: Vec<String>,
    ctes: HashSet<String>,
}

impl TableRefs {
    fn collect_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_ascii_lowercase());
                self.collect_query(&cte.query);
            }
        }
        self.collect_set_expr(&query.body);
    }

    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table_with_joins in &select.from {
                    self.collect_table_with_joins(table_with_joins);
                }
                for item in &select.projection {
                    match item {
                        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                            self.collect_expr(expr)
                        }
                        _ => {}
                    }
                }
                if let Some(selection) = &select.selection {
                    self.collect_expr(selection);
                }
                if let Some(having) = &select.having {
                    self.collect_expr(having);
                }
            }
            SetExpr::Query(query) => self.collect_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            _ => {}
        }
    }

    /// Subqueries nested in predicates and select items.
    fn collect_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Subquery(query) => self.collect_query(query),
            Expr::Exists { subquery, .. } => self.collect_query(subquery),
            Expr::InSubquery { expr, subquery, .. } => {
                self.collect_expr(expr);
                self.collect_query(subquery);
            }
            Expr::BinaryOp { left, right, .. } => {
                self.collect_expr(left);
                self.collect_expr(right);
            }
            Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => self.collect_expr(expr),
            _ => {}
        }
    }

    fn collect_table_with_joins(&mut self, table_with_joins: &TableWithJoins) {
        self.collect_factor(&table_with_joins.relation);
        for join in &table_with_joins.joins {
            self.collect_factor(&join.relation);
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, .. } => {
                let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();
                self.tables.push(parts.join("."));
            }
            TableFactor::Derived { subquery, .. } => self.collect_query(subquery),
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.collect_table_with_joins(table_with_joins)
            }
            _ => {}
        }
    }
}
