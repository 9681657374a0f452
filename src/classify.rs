//! Query classification.
//!
//! Routing needs to know one thing about a query before it runs: can it
//! observe or produce side effects? The classifier answers with a closed
//! set of kinds, decided once per query and consumed by a single routing
//! function. Raw SQL is classified by an explicit keyword table rather
//! than by guessing from call-site shape; anything the table cannot prove
//! is [QueryKind::Ambiguous] and handled conservatively.

/// What the router can know about a query without executing it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueryKind {
    /// Provably free of side effects.
    Read,
    /// Mutates data, or is a statement class that must run on the primary
    /// regardless (DDL, locks).
    Write,
    /// Effect cannot be determined by inspection.
    Ambiguous,
    /// Catalog/metadata access. Replicas may lag schema changes, so these
    /// always run on the primary.
    Schema,
}

/// A structured operation reported by a calling layer that already knows
/// what it is doing, sparing the router the SQL inspection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    /// Catalog reflection, e.g. schema-cache population.
    SchemaReflection,
    /// A custom statement the caller cannot vouch for.
    Custom,
}

/// A query that is about to run.
#[derive(Clone, Debug)]
pub enum Query<'a> {
    /// A raw SQL statement, classified by inspection.
    Statement(&'a str),
    /// An operation the caller has already shaped.
    Operation(Operation),
}

impl Query<'_> {
    pub fn kind(&self) -> QueryKind {
        classify(self)
    }
}

/// Classifies a query. Pure with respect to the query text and operation
/// kind.
pub fn classify(query: &Query<'_>) -> QueryKind {
    match query {
        Query::Operation(op) => match op {
            Operation::Select => QueryKind::Read,
            Operation::Insert | Operation::Update | Operation::Delete => QueryKind::Write,
            Operation::SchemaReflection => QueryKind::Schema,
            Operation::Custom => QueryKind::Ambiguous,
        },
        Query::Statement(sql) => classify_statement(sql),
    }
}

fn classify_statement(sql: &str) -> QueryKind {
    let body = strip_leading_noise(sql);
    let keyword = leading_keyword(body).to_ascii_lowercase();

    match keyword.as_str() {
        "select" | "values" | "table" | "show" => {
            if references_catalog(sql) {
                QueryKind::Schema
            } else {
                QueryKind::Read
            }
        }

        "insert" | "update" | "delete" | "replace" | "merge" | "truncate" | "create" | "alter"
        | "drop" | "grant" | "revoke" | "lock" | "copy" => QueryKind::Write,

        // A CTE can wrap data-modifying statements. Scanning for DML
        // keywords can only misfire toward the primary, which is safe.
        "with" => {
            if contains_dml(sql) {
                QueryKind::Write
            } else {
                QueryKind::Read
            }
        }

        // Session/transaction control and everything unrecognized.
        _ => QueryKind::Ambiguous,
    }
}

// Skips whitespace, opening parentheses, and SQL comments before the
// first keyword.
fn strip_leading_noise(mut sql: &str) -> &str {
    loop {
        sql = sql.trim_start();
        if let Some(rest) = sql.strip_prefix('(') {
            sql = rest;
        } else if let Some(rest) = sql.strip_prefix("--") {
            sql = rest.split_once('\n').map_or("", |(_, tail)| tail);
        } else if let Some(rest) = sql.strip_prefix("/*") {
            sql = rest.split_once("*/").map_or("", |(_, tail)| tail);
        } else {
            return sql;
        }
    }
}

fn leading_keyword(sql: &str) -> &str {
    sql.split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or("")
}

fn references_catalog(sql: &str) -> bool {
    let lower = sql.to_ascii_lowercase();
    lower.contains("information_schema") || lower.contains("pg_catalog")
}

fn contains_dml(sql: &str) -> bool {
    let lower = sql.to_ascii_lowercase();
    ["insert", "update", "delete"]
        .iter()
        .any(|keyword| contains_word(&lower, keyword))
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(start, _)| {
        let bytes = haystack.as_bytes();
        let before_ok = start == 0 || !is_word_byte(bytes[start - 1]);
        let end = start + word.len();
        let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
        before_ok && after_ok
    })
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}
