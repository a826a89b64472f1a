//! Static SQL analysis.
//!
//! Pattern checks over the query text. Keyword checks run on the text with
//! string literals masked so a keyword inside a literal never fires;
//! `LIKE` patterns are read from the original text.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use poolgrid_core::Severity;

/// Catalog of analysis findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCode {
    SelectStar,
    MissingWhere,
    LeadingWildcard,
    OrConditions,
    NotIn,
    LargeLimit,
    UnboundedResult,
    JoinWithoutCondition,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningCode::SelectStar => "SELECT_STAR",
            WarningCode::MissingWhere => "MISSING_WHERE",
            WarningCode::LeadingWildcard => "LEADING_WILDCARD",
            WarningCode::OrConditions => "OR_CONDITIONS",
            WarningCode::NotIn => "NOT_IN",
            WarningCode::LargeLimit => "LARGE_LIMIT",
            WarningCode::UnboundedResult => "UNBOUNDED_RESULT",
            WarningCode::JoinWithoutCondition => "JOIN_WITHOUT_CONDITION",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            WarningCode::MissingWhere => Severity::Error,
            WarningCode::OrConditions | WarningCode::UnboundedResult => Severity::Info,
            _ => Severity::Warning,
        }
    }

    /// Fix suggested on each warning, and on reports in which this code
    /// appears.
    pub fn recommendation(&self) -> &'static str {
        match self {
            WarningCode::SelectStar => "Select only the columns you need instead of SELECT *",
            WarningCode::MissingWhere => {
                "Add a WHERE clause to UPDATE and DELETE statements to avoid touching every row"
            }
            WarningCode::LeadingWildcard => {
                "Avoid leading wildcards in LIKE patterns; they prevent index use"
            }
            WarningCode::OrConditions => {
                "Consider rewriting OR conditions as IN lists or UNION for better index use"
            }
            WarningCode::NotIn => "Replace NOT IN with NOT EXISTS or an anti-join",
            WarningCode::LargeLimit => "Paginate instead of fetching very large pages",
            WarningCode::UnboundedResult => "Add a LIMIT to queries that may return many rows",
            WarningCode::JoinWithoutCondition => {
                "Give every JOIN an ON or USING condition to avoid cartesian products"
            }
        }
    }
}

impl std::fmt::Display for WarningCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding of the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryWarning {
    pub code: WarningCode,
    pub severity: Severity,
    pub message: String,
    pub suggestion: String,
}

impl QueryWarning {
    fn new(code: WarningCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
            suggestion: code.recommendation().to_string(),
        }
    }
}

struct Patterns {
    string_literal: Regex,
    number: Regex,
    whitespace: Regex,
    select_star: Regex,
    write_statement: Regex,
    where_clause: Regex,
    leading_wildcard: Regex,
    or_in_where: Regex,
    not_in: Regex,
    limit: Regex,
    select_from: Regex,
    join: Regex,
    join_condition: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            string_literal: Regex::new(r"'(?:[^']|'')*'")?,
            number: Regex::new(r"\b\d+(?:\.\d+)?\b")?,
            whitespace: Regex::new(r"\s+")?,
            select_star: Regex::new(r"(?i)\bselect\s+(?:distinct\s+)?\*")?,
            write_statement: Regex::new(r"(?i)^\s*(update|delete)\b")?,
            where_clause: Regex::new(r"(?i)\bwhere\b")?,
            leading_wildcard: Regex::new(r"(?i)\bi?like\s+'%")?,
            or_in_where: Regex::new(r"(?is)\bwhere\b.*\bor\b")?,
            not_in: Regex::new(r"(?i)\bnot\s+in\s*\(")?,
            limit: Regex::new(r"(?i)\blimit\s+(\d+)")?,
            select_from: Regex::new(r"(?is)^\s*select\b.*\bfrom\b")?,
            join: Regex::new(r"(?i)\bjoin\b")?,
            join_condition: Regex::new(r"(?i)\b(?:on|using)\b")?,
        })
    }
}

static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();

fn patterns() -> Option<&'static Patterns> {
    match PATTERNS.get_or_init(Patterns::compile) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(error = %e, "SQL analysis patterns failed to compile, analysis disabled");
            None
        }
    }
}

/// Collapse a query into its shape: literals become `?`, whitespace is
/// collapsed, and a trailing semicolon is dropped.
pub fn normalize_sql(sql: &str) -> String {
    let Some(p) = patterns() else {
        return sql.split_whitespace().collect::<Vec<_>>().join(" ");
    };
    let masked = p.string_literal.replace_all(sql, "?");
    let masked = p.number.replace_all(&masked, "?");
    let collapsed = p.whitespace.replace_all(masked.trim(), " ");
    collapsed.trim_end_matches(';').trim_end().to_string()
}

/// Run every catalog check against `sql`.
///
/// `max_limit` is the largest `LIMIT` that is not flagged.
pub fn analyze_query(sql: &str, max_limit: u64) -> Vec<QueryWarning> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    let masked = p.string_literal.replace_all(sql, "''");
    let masked: &str = &masked;
    let mut warnings = Vec::new();

    if p.select_star.is_match(masked) {
        warnings.push(QueryWarning::new(
            WarningCode::SelectStar,
            "query selects every column with SELECT *",
        ));
    }

    if let Some(caps) = p.write_statement.captures(masked) {
        if !p.where_clause.is_match(masked) {
            let verb = caps[1].to_uppercase();
            warnings.push(QueryWarning::new(
                WarningCode::MissingWhere,
                format!("{verb} without WHERE affects every row"),
            ));
        }
    }

    if p.leading_wildcard.is_match(sql) {
        warnings.push(QueryWarning::new(
            WarningCode::LeadingWildcard,
            "LIKE pattern starts with a wildcard",
        ));
    }

    if p.or_in_where.is_match(masked) {
        warnings.push(QueryWarning::new(
            WarningCode::OrConditions,
            "WHERE clause contains OR conditions",
        ));
    }

    if p.not_in.is_match(masked) {
        warnings.push(QueryWarning::new(
            WarningCode::NotIn,
            "NOT IN subquery or list; NULLs make it match nothing",
        ));
    }

    let limits: Vec<u64> = p
        .limit
        .captures_iter(masked)
        .filter_map(|c| c[1].parse::<u64>().ok())
        .collect();
    if let Some(largest) = limits.iter().copied().max().filter(|l| *l > max_limit) {
        warnings.push(QueryWarning::new(
            WarningCode::LargeLimit,
            format!("LIMIT {largest} exceeds {max_limit}"),
        ));
    }

    if p.select_from.is_match(masked) && limits.is_empty() {
        warnings.push(QueryWarning::new(
            WarningCode::UnboundedResult,
            "SELECT without LIMIT may return an unbounded result",
        ));
    }

    let joins = p.join.find_iter(masked).count();
    let conditions = p.join_condition.find_iter(masked).count();
    if joins > conditions {
        warnings.push(QueryWarning::new(
            WarningCode::JoinWithoutCondition,
            format!("{joins} JOINs but only {conditions} ON/USING conditions"),
        ));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(sql: &str) -> Vec<WarningCode> {
        analyze_query(sql, 1000).into_iter().map(|w| w.code).collect()
    }

    #[test]
    fn select_star_flagged() {
        let warnings = analyze_query("SELECT * FROM users", 1000);
        assert_eq!(warnings[0].code, WarningCode::SelectStar);
        assert_eq!(warnings[0].severity, Severity::Warning);
        assert_eq!(
            warnings[0].suggestion,
            "Select only the columns you need instead of SELECT *"
        );
        assert!(codes("select distinct * from users limit 5").contains(&WarningCode::SelectStar));
    }

    #[test]
    fn qualified_star_and_count_are_fine() {
        assert!(!codes("SELECT u.* FROM users u LIMIT 10").contains(&WarningCode::SelectStar));
        assert!(!codes("SELECT COUNT(*) FROM users LIMIT 1").contains(&WarningCode::SelectStar));
    }

    #[test]
    fn delete_without_where_is_error() {
        let warnings = analyze_query("DELETE FROM sessions", 1000);
        let missing = warnings
            .iter()
            .find(|w| w.code == WarningCode::MissingWhere)
            .unwrap();
        assert_eq!(missing.severity, Severity::Error);
        assert!(missing.message.starts_with("DELETE"));
        assert!(missing.suggestion.contains("WHERE clause"));

        assert!(!codes("DELETE FROM sessions WHERE expires_at < now()")
            .contains(&WarningCode::MissingWhere));
        assert!(codes("update users set active = false").contains(&WarningCode::MissingWhere));
    }

    #[test]
    fn keyword_inside_literal_does_not_count() {
        assert!(codes("UPDATE notes SET body = 'see where clause'")
            .contains(&WarningCode::MissingWhere));
    }

    #[test]
    fn leading_wildcard() {
        assert!(codes("SELECT id FROM users WHERE name LIKE '%son' LIMIT 5")
            .contains(&WarningCode::LeadingWildcard));
        assert!(!codes("SELECT id FROM users WHERE name LIKE 'jo%' LIMIT 5")
            .contains(&WarningCode::LeadingWildcard));
    }

    #[test]
    fn or_and_not_in() {
        let found = codes("SELECT id FROM t WHERE a = 1 OR b = 2 AND c NOT IN (1, 2) LIMIT 5");
        assert!(found.contains(&WarningCode::OrConditions));
        assert!(found.contains(&WarningCode::NotIn));
        assert_eq!(WarningCode::OrConditions.severity(), Severity::Info);
    }

    #[test]
    fn limit_checks() {
        assert!(codes("SELECT id FROM t LIMIT 5000").contains(&WarningCode::LargeLimit));
        assert!(!codes("SELECT id FROM t LIMIT 1000").contains(&WarningCode::LargeLimit));
        assert!(codes("SELECT id FROM t").contains(&WarningCode::UnboundedResult));
        assert!(!codes("SELECT id FROM t LIMIT 10").contains(&WarningCode::UnboundedResult));
        assert!(!codes("SELECT 1").contains(&WarningCode::UnboundedResult));
    }

    #[test]
    fn join_without_condition() {
        assert!(codes("SELECT a.id FROM a JOIN b LIMIT 5")
            .contains(&WarningCode::JoinWithoutCondition));
        assert!(!codes("SELECT a.id FROM a JOIN b ON a.id = b.a_id LIMIT 5")
            .contains(&WarningCode::JoinWithoutCondition));
        assert!(!codes("SELECT a.id FROM a JOIN b USING (id) LIMIT 5")
            .contains(&WarningCode::JoinWithoutCondition));
    }

    #[test]
    fn clean_query_has_no_warnings() {
        assert!(codes("SELECT id, name FROM users WHERE id = $1 LIMIT 1").is_empty());
    }

    #[test]
    fn normalize_masks_literals() {
        assert_eq!(
            normalize_sql("SELECT  id FROM users\n WHERE name = 'O''Brien' AND age > 42;"),
            "SELECT id FROM users WHERE name = ? AND age > ?"
        );
    }

    #[test]
    fn every_warning_carries_a_suggestion() {
        let warnings = analyze_query(
            "SELECT * FROM a JOIN b WHERE a.x LIKE '%z' OR a.y NOT IN (1) LIMIT 9000",
            1000,
        );
        assert!(warnings.len() >= 5);
        for w in &warnings {
            assert_eq!(w.suggestion, w.code.recommendation(), "{}", w.code);
        }

        let json = serde_json::to_value(&warnings[0]).unwrap();
        assert_eq!(json["suggestion"], warnings[0].code.recommendation());
    }

    #[test]
    fn codes_serialize_in_catalog_form() {
        let json = serde_json::to_string(&WarningCode::JoinWithoutCondition).unwrap();
        assert_eq!(json, "\"JOIN_WITHOUT_CONDITION\"");
        assert_eq!(WarningCode::LargeLimit.to_string(), "LARGE_LIMIT");
    }
}
