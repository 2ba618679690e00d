//! # Query DSL Parser
//!
//! Parses a SQL-like query string into a [`LogicalQuery`]. Every table in
//! `FROM` becomes one sub-query sharing the `WHERE` conditions.
//!
//! Syntax:
//! ```text
//! SELECT time, msg FROM log.app, log.db WHERE level = "error" AND path MATCHES "^/api"
//!     SINCE 15m UNTIL 1m ORDER BY -time, seq LIMIT 100 OFFSET 0 SCROLL 5m
//! ```

use cfx_core::{
    CompareOp, Condition, Error, LogicalQuery, OrderKey, Result, SubQuery, DEFAULT_LIMIT,
};
use serde_json::Value;

use super::parse_duration_secs;

const CLAUSES: [&str; 9] = [
    "SELECT", "FROM", "WHERE", "SINCE", "UNTIL", "ORDER BY", "LIMIT", "OFFSET", "SCROLL",
];

/// Parse a raw query string into a [`LogicalQuery`].
pub fn parse(input: &str) -> Result<LogicalQuery> {
    parse_with_limit(input, DEFAULT_LIMIT)
}

/// Like [`parse`], with the page size used when there is no `LIMIT`.
pub fn parse_with_limit(input: &str, default_limit: usize) -> Result<LogicalQuery> {
    let input = input.trim();
    let upper = input.to_ascii_uppercase();
    let clause = |keyword: &str| clause_body(input, &upper, keyword);

    let tables: Vec<String> = clause("FROM")
        .map(|from| {
            from.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if tables.is_empty() {
        return Err(Error::compile(format!("query has no FROM tables: '{}'", input)));
    }

    let fields: Vec<String> = match clause("SELECT") {
        Some(select) if select != "*" => select
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    let conditions = match clause("WHERE") {
        Some(body) => parse_conditions(body)?,
        None => Vec::new(),
    };

    let mut query = LogicalQuery {
        queries: tables
            .into_iter()
            .map(|table_id| SubQuery {
                table_id,
                conditions: conditions.clone(),
                fields: fields.clone(),
                ..Default::default()
            })
            .collect(),
        start: clause("SINCE").map(str::to_string),
        end: clause("UNTIL").map(str::to_string),
        limit: default_limit,
        ..Default::default()
    };

    if let Some(order) = clause("ORDER BY") {
        query.order_by = parse_order_by(order)?;
    }
    if let Some(limit) = clause("LIMIT") {
        query.limit = parse_count("LIMIT", limit)?;
    }
    if let Some(offset) = clause("OFFSET") {
        query.from = parse_count("OFFSET", offset)?;
    }
    if let Some(scroll) = clause("SCROLL") {
        query.scroll_secs = Some(parse_duration_secs(scroll)?);
    }
    Ok(query)
}

/// Text following `keyword` up to the next clause keyword.
fn clause_body<'a>(input: &'a str, upper: &str, keyword: &str) -> Option<&'a str> {
    let start = find_keyword(upper, keyword, 0)? + keyword.len();
    let end = CLAUSES
        .iter()
        .filter_map(|kw| find_keyword(upper, kw, start))
        .min()
        .unwrap_or(input.len());
    Some(input[start..end].trim())
}

/// Position of `keyword` as a whole word outside quotes, at or after `from`.
fn find_keyword(upper: &str, keyword: &str, from: usize) -> Option<usize> {
    let bytes = upper.as_bytes();
    let mut quote: Option<u8> = None;
    for i in 0..bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => continue,
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None => {}
        }
        if i < from || quote.is_some() {
            continue;
        }
        let before_ok = i == 0 || bytes[i - 1].is_ascii_whitespace();
        let after = i + keyword.len();
        let after_ok = after >= bytes.len() || bytes[after].is_ascii_whitespace();
        if before_ok && after_ok && bytes[i..].starts_with(keyword.as_bytes()) {
            return Some(i);
        }
    }
    None
}

fn parse_count(clause: &str, raw: &str) -> Result<usize> {
    raw.parse::<usize>()
        .map_err(|_| Error::compile(format!("{} expects a number, got '{}'", clause, raw)))
}

fn parse_order_by(raw: &str) -> Result<Vec<OrderKey>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|key| {
            let upper = key.to_ascii_uppercase();
            if let Some(field) = upper.strip_suffix(" DESC").map(|_| &key[..key.len() - 5]) {
                Ok(OrderKey::desc(field.trim()))
            } else if let Some(field) = upper.strip_suffix(" ASC").map(|_| &key[..key.len() - 4]) {
                Ok(OrderKey::asc(field.trim()))
            } else {
                OrderKey::parse(key)
            }
        })
        .collect()
}

fn parse_conditions(s: &str) -> Result<Vec<Condition>> {
    let mut conditions = Vec::new();
    for part in split_and(s) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (pos, op, len) = find_operator(part)
            .ok_or_else(|| Error::compile(format!("Cannot parse condition: '{}'", part)))?;
        let field = part[..pos].trim();
        if field.is_empty() {
            return Err(Error::compile(format!("condition without a field: '{}'", part)));
        }
        conditions.push(Condition {
            field: field.to_string(),
            op,
            value: parse_value(part[pos + len..].trim()),
        });
    }
    Ok(conditions)
}

/// First operator outside quotes: (byte position, operator, byte length).
fn find_operator(part: &str) -> Option<(usize, CompareOp, usize)> {
    const SYMBOLS: [(&str, CompareOp); 6] = [
        (">=", CompareOp::Gte),
        ("<=", CompareOp::Lte),
        ("!=", CompareOp::Neq),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        ("=", CompareOp::Eq),
    ];
    const WORDS: [(&str, CompareOp); 3] = [
        (" CONTAINS ", CompareOp::Contains),
        (" STARTSWITH ", CompareOp::StartsWith),
        (" MATCHES ", CompareOp::Matches),
    ];

    let upper = part.to_ascii_uppercase();
    let bytes = part.as_bytes();
    let mut quote: Option<u8> = None;
    for i in 0..bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => {
                quote = None;
                continue;
            }
            Some(_) => continue,
            None if b == b'"' || b == b'\'' => {
                quote = Some(b);
                continue;
            }
            None => {}
        }
        let rest = &upper.as_bytes()[i..];
        if let Some((sym, op)) = SYMBOLS.iter().find(|(sym, _)| rest.starts_with(sym.as_bytes())) {
            return Some((i, *op, sym.len()));
        }
        if let Some((word, op)) = WORDS.iter().find(|(word, _)| rest.starts_with(word.as_bytes())) {
            return Some((i, *op, word.len()));
        }
    }
    None
}

fn split_and(s: &str) -> Vec<&str> {
    let upper = s.to_ascii_uppercase();
    let mut parts = Vec::new();
    let mut last = 0;
    while let Some(pos) = find_keyword(&upper, "AND", last) {
        parts.push(&s[last..pos]);
        last = pos + 3;
    }
    parts.push(&s[last..]);
    parts
}

fn parse_value(s: &str) -> Value {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return Value::String(s[1..s.len() - 1].to_string());
        }
    }
    if let Ok(n) = s.parse::<i64>() {
        Value::Number(n.into())
    } else if let Ok(n) = s.parse::<f64>() {
        serde_json::json!(n)
    } else if s == "true" {
        Value::Bool(true)
    } else if s == "false" {
        Value::Bool(false)
    } else if s == "null" {
        Value::Null
    } else {
        Value::String(s.to_string())
    }
}
