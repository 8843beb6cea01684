//! Filter and order-by expressions for list queries.
//!
//! A filter is a conjunction of `attr op value` terms joined by `and`:
//!
//! ```text
//! state = AVAILABLE and trial = true and created_at < '2026-01-01T00:00:00Z'
//! ```
//!
//! Attributes are checked against a per-entity whitelist and every value is
//! bound as a parameter, so caller input never reaches the SQL text.

use sqlx::{QueryBuilder, Sqlite};

use super::models::{format_ts, parse_ts};
use crate::types::{PoolError, PoolResult};

/// Filterable and sortable claim attributes.
pub const CLAIM_KEYS: &[&str] = &[
    "id",
    "registration_id",
    "state",
    "trial",
    "assigned_at",
    "created_at",
    "expires_at",
    "updated_at",
];

/// Filterable and sortable registration attributes.
pub const REGISTRATION_KEYS: &[&str] = &["id", "state", "created_at", "updated_at"];

const TIMESTAMP_KEYS: &[&str] = &["assigned_at", "created_at", "expires_at", "updated_at"];

pub const DEFAULT_ORDER_BY: &str = "updated_at DESC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    // Two-character operators first so `<=` is not read as `<`.
    const TOKENS: [(&'static str, Op); 6] = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("!=", Op::Ne),
        ("=", Op::Eq),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];

    fn sql(&self) -> &'static str {
        match self {
            Op::Eq => " = ",
            Op::Ne => " != ",
            Op::Lt => " < ",
            Op::Le => " <= ",
            Op::Gt => " > ",
            Op::Ge => " >= ",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    column: &'static str,
    op: Op,
    value: Value,
}

/// A parsed, whitelisted filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<Term>,
}

impl Filter {
    pub fn parse(input: &str, allowed: &[&'static str]) -> PoolResult<Self> {
        let mut terms = Vec::new();
        for raw in split_and(input) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            terms.push(parse_term(raw, allowed)?);
        }
        Ok(Self { terms })
    }

    /// Parse an optional filter; `None` and blank input match everything.
    pub fn parse_opt(input: Option<&str>, allowed: &[&'static str]) -> PoolResult<Self> {
        match input {
            Some(input) => Self::parse(input, allowed),
            None => Ok(Self::default()),
        }
    }

    /// Append ` AND col op ?` for each term.
    pub fn push_to(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        for term in &self.terms {
            qb.push(" AND ").push(term.column).push(term.op.sql());
            match &term.value {
                Value::Text(v) => qb.push_bind(v.clone()),
                Value::Bool(v) => qb.push_bind(*v),
            };
        }
    }
}

fn split_and(input: &str) -> Vec<&str> {
    let lower = input.to_ascii_lowercase();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(pos) = lower[search..].find(" and ") {
        let at = search + pos;
        parts.push(&input[start..at]);
        start = at + 5;
        search = start;
    }
    parts.push(&input[start..]);
    parts
}

fn parse_term(raw: &str, allowed: &[&'static str]) -> PoolResult<Term> {
    let (pos, token, op) = Op::TOKENS
        .iter()
        .filter_map(|(token, op)| raw.find(token).map(|pos| (pos, *token, *op)))
        .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())))
        .ok_or_else(|| PoolError::bad_request(format!("invalid filter term: {}", raw)))?;

    let name = raw[..pos].trim().to_ascii_lowercase();
    let column = allowed
        .iter()
        .copied()
        .find(|key| *key == name)
        .ok_or_else(|| PoolError::bad_request(format!("unsupported filter key: {}", name)))?;
    let literal = unquote(raw[pos + token.len()..].trim());

    let value = match column {
        "trial" => match literal.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return Err(PoolError::bad_request(format!("invalid boolean: {}", literal))),
        },
        "state" => Value::Text(literal.to_ascii_uppercase()),
        c if TIMESTAMP_KEYS.contains(&c) => {
            let ts = parse_ts(literal)
                .map_err(|_| PoolError::bad_request(format!("invalid timestamp: {}", literal)))?;
            Value::Text(format_ts(ts))
        }
        _ => Value::Text(literal.to_string()),
    };

    Ok(Term { column, op, value })
}

fn unquote(s: &str) -> &str {
    for quote in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Validate `attr [asc|desc], ...` and render it as SQL.
pub fn order_by_clause(input: Option<&str>, allowed: &[&'static str]) -> PoolResult<String> {
    let Some(input) = input.filter(|s| !s.trim().is_empty()) else {
        return Ok(DEFAULT_ORDER_BY.to_string());
    };

    let mut keys = Vec::new();
    for part in input.split(',') {
        let mut words = part.split_whitespace();
        let name = words.next().unwrap_or_default().to_ascii_lowercase();
        let column = allowed
            .iter()
            .copied()
            .find(|key| *key == name)
            .ok_or_else(|| PoolError::bad_request(format!("unsupported order key: {}", name)))?;
        let direction = match words.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("asc") => "ASC",
            Some("desc") => "DESC",
            Some(other) => {
                return Err(PoolError::bad_request(format!("invalid order direction: {}", other)));
            }
        };
        if words.next().is_some() {
            return Err(PoolError::bad_request(format!("invalid order term: {}", part.trim())));
        }
        keys.push(format!("{} {}", column, direction));
    }
    Ok(keys.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conjunction() {
        let filter = Filter::parse(
            "state = available AND trial=true and created_at <= '2026-01-01T00:00:00Z'",
            CLAIM_KEYS,
        )
        .unwrap();
        assert_eq!(filter.terms.len(), 3);
        assert_eq!(filter.terms[0].value, Value::Text("AVAILABLE".into()));
        assert_eq!(filter.terms[1].value, Value::Bool(true));
        assert_eq!(filter.terms[2].op, Op::Le);
        assert_eq!(
            filter.terms[2].value,
            Value::Text("2026-01-01T00:00:00.000Z".into())
        );
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(Filter::parse("system_password = x", CLAIM_KEYS).is_err());
        assert!(Filter::parse("trial = true", REGISTRATION_KEYS).is_err());
        assert!(Filter::parse("state", CLAIM_KEYS).is_err());
        assert!(Filter::parse("trial = maybe", CLAIM_KEYS).is_err());
    }

    #[test]
    fn test_blank_filter_adds_no_terms() {
        for filter in [
            Filter::parse("  ", CLAIM_KEYS).unwrap(),
            Filter::parse_opt(None, CLAIM_KEYS).unwrap(),
        ] {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tenant_claims WHERE 1 = 1");
            filter.push_to(&mut qb);
            assert_eq!(qb.sql(), "SELECT * FROM tenant_claims WHERE 1 = 1");
        }
    }

    #[test]
    fn test_push_binds_values() {
        let filter = Filter::parse("id != \"t-1\"", CLAIM_KEYS).unwrap();
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tenant_claims WHERE 1 = 1");
        filter.push_to(&mut qb);
        assert_eq!(qb.sql(), "SELECT * FROM tenant_claims WHERE 1 = 1 AND id != ?");
    }

    #[test]
    fn test_order_by() {
        assert_eq!(order_by_clause(None, CLAIM_KEYS).unwrap(), DEFAULT_ORDER_BY);
        assert_eq!(
            order_by_clause(Some("created_at, state desc"), CLAIM_KEYS).unwrap(),
            "created_at ASC, state DESC"
        );
        assert!(order_by_clause(Some("created_at sideways"), CLAIM_KEYS).is_err());
        assert!(order_by_clause(Some("config"), REGISTRATION_KEYS).is_err());
    }
}
