//! Fragment Hasher (C1), §4.1: turns a SELECT into a canonical textual form
//! and a stable 128-bit hash such that cosmetic variation never perturbs the
//! hash. Built directly on `sqlparser`, the same crate and `GenericDialect`
//! the teacher's SQL front-end parsed statements with.

use sha2::{Digest, Sha256};
use sqlparser::ast::{
    BinaryOperator, Expr, Query, SetExpr, Statement, TableFactor, TableWithJoins,
    Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::PartitionCacheError;

/// Default distance-predicate bucket step (§4.1 step 3), overridable via
/// [`FragmentHasher::with_bucket_step`].
pub const DEFAULT_BUCKET_STEP: f64 = 1.0;

/// A parsed, normalized fragment: its canonical text and the hash derived
/// from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFragment {
    pub canonical_sql: String,
    pub hash: String,
}

/// Canonicalizes SELECT fragments into a stable hash (§4.1).
pub struct FragmentHasher {
    dialect: GenericDialect,
    bucket_step: f64,
}

impl FragmentHasher {
    pub fn new() -> Self {
        Self { dialect: GenericDialect {}, bucket_step: DEFAULT_BUCKET_STEP }
    }

    pub fn with_bucket_step(bucket_step: f64) -> Self {
        Self { dialect: GenericDialect {}, bucket_step }
    }

    /// Runs the full canonicalization pipeline and returns the canonical
    /// text plus its hash. Fails with `UnsupportedSyntax` for anything
    /// outside the allowed subset (§4.1 step 1).
    pub fn hash_fragment(&self, sql: &str) -> crate::Result<CanonicalFragment> {
        let statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| PartitionCacheError::UnsupportedSyntax(e.to_string()))?;
        if statements.len() != 1 {
            return Err(PartitionCacheError::UnsupportedSyntax(
                "fragment must be exactly one statement".into(),
            ));
        }
        let Statement::Query(query) = statements.into_iter().next().unwrap() else {
            return Err(PartitionCacheError::UnsupportedSyntax("fragment must be a SELECT".into()));
        };
        self.canonicalize_query(&query)
    }

    fn canonicalize_query(&self, query: &Query) -> crate::Result<CanonicalFragment> {
        if query.with.is_some() {
            return Err(PartitionCacheError::UnsupportedSyntax("CTEs are not allowed in fragments".into()));
        }
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(PartitionCacheError::UnsupportedSyntax(
                "set operations are not allowed in fragments".into(),
            ));
        };
        if has_group_by(select) {
            return Err(PartitionCacheError::UnsupportedSyntax("GROUP BY is not allowed in fragments".into()));
        }
        if select.having.is_some() {
            return Err(PartitionCacheError::UnsupportedSyntax("HAVING is not allowed in fragments".into()));
        }

        // Step 4: table-order canonicalization; alias renaming (step 2) falls
        // out of this order.
        let tables = extract_base_tables(&select.from)?;
        let mut ordered: Vec<(usize, &(String, String))> = tables.iter().enumerate().collect();
        ordered.sort_by(|(_, a), (_, b)| a.cmp(b));
        let alias_map: std::collections::HashMap<String, String> = ordered
            .iter()
            .enumerate()
            .map(|(new_idx, (_, (_, original_alias)))| (original_alias.clone(), format!("t{}", new_idx + 1)))
            .collect();

        let from_sql = ordered
            .iter()
            .enumerate()
            .map(|(new_idx, (_, (table_name, _)))| format!("{table_name} AS t{}", new_idx + 1))
            .collect::<Vec<_>>()
            .join(", ");

        // Step 3 + 5: predicate normalization, BETWEEN expansion, then
        // predicate-order canonicalization over the rendered atoms.
        let mut atoms = Vec::new();
        if let Some(selection) = &select.selection {
            collect_conjuncts(selection, &mut atoms)?;
        }
        let mut rendered: Vec<String> = Vec::new();
        for atom in &atoms {
            rendered.extend(self.render_atom(atom, &alias_map)?);
        }
        rendered.sort();

        let distinct = select.distinct.is_some();
        let mut canonical = String::new();
        canonical.push_str("SELECT ");
        if distinct {
            canonical.push_str("DISTINCT ");
        }
        canonical.push('1'); // projection is irrelevant to existence-only fragment identity
        canonical.push_str(" FROM ");
        canonical.push_str(&from_sql);
        if !rendered.is_empty() {
            canonical.push_str(" WHERE ");
            canonical.push_str(&rendered.join(" AND "));
        }

        let hash = hash_text(&canonical);
        Ok(CanonicalFragment { canonical_sql: canonical, hash })
    }

    /// Renders one atomic predicate, expanding BETWEEN into two atoms and
    /// bucketing distance-predicate thresholds (§4.1 step 3).
    fn render_atom(
        &self,
        expr: &Expr,
        alias_map: &std::collections::HashMap<String, String>,
    ) -> crate::Result<Vec<String>> {
        match expr {
            Expr::Between { expr, negated: false, low, high } => {
                let operand = render_expr(expr, alias_map)?;
                Ok(vec![
                    format!("{operand} >= {}", render_expr(low, alias_map)?),
                    format!("{operand} <= {}", render_expr(high, alias_map)?),
                ])
            }
            Expr::Function(func) if is_distance_predicate(func) => {
                Ok(vec![self.render_distance_predicate(func, alias_map)?])
            }
            Expr::BinaryOp { left, op: BinaryOperator::Eq, right }
            | Expr::BinaryOp { left, op: BinaryOperator::NotEq, right } => {
                let op_str = if matches!(expr, Expr::BinaryOp { op: BinaryOperator::Eq, .. }) { "=" } else { "<>" };
                let mut l = render_expr(left, alias_map)?;
                let mut r = render_expr(right, alias_map)?;
                if r < l {
                    std::mem::swap(&mut l, &mut r);
                }
                Ok(vec![format!("{l} {op_str} {r}")])
            }
            other => Ok(vec![render_expr(other, alias_map)?]),
        }
    }

    fn render_distance_predicate(
        &self,
        func: &sqlparser::ast::Function,
        alias_map: &std::collections::HashMap<String, String>,
    ) -> crate::Result<String> {
        let name = func.name.to_string();
        let args = function_args(func)?;
        if args.len() != 3 {
            return Err(PartitionCacheError::UnsupportedSyntax(format!(
                "{name} expects 3 arguments"
            )));
        }
        let x = render_expr(&args[0], alias_map)?;
        let y = render_expr(&args[1], alias_map)?;
        let distance = literal_f64(&args[2])?;
        let bucketed = bucket(distance, self.bucket_step);
        Ok(format!("{name}({x}, {y}, {})", format_numeric(bucketed)))
    }
}

impl Default for FragmentHasher {
    fn default() -> Self {
        Self::new()
    }
}

fn has_group_by(select: &sqlparser::ast::Select) -> bool {
    match &select.group_by {
        sqlparser::ast::GroupByExpr::All(_) => true,
        sqlparser::ast::GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
    }
}

pub(crate) fn extract_base_tables(from: &[TableWithJoins]) -> crate::Result<Vec<(String, String)>> {
    if from.is_empty() {
        return Err(PartitionCacheError::UnsupportedSyntax("fragment has no FROM tables".into()));
    }
    let mut tables = Vec::new();
    for twj in from {
        if !twj.joins.is_empty() {
            return Err(PartitionCacheError::UnsupportedSyntax(
                "explicit JOIN syntax is not allowed in fragments; use a WHERE conjunction".into(),
            ));
        }
        tables.push(base_table(&twj.relation)?);
    }
    Ok(tables)
}

fn base_table(factor: &TableFactor) -> crate::Result<(String, String)> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let table_name = name.to_string();
            let original_alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| table_name.clone());
            Ok((table_name, original_alias))
        }
        _ => Err(PartitionCacheError::UnsupportedSyntax(
            "only base table references are allowed in FROM".into(),
        )),
    }
}

pub(crate) fn collect_conjuncts(expr: &Expr, out: &mut Vec<Expr>) -> crate::Result<()> {
    match expr {
        Expr::BinaryOp { left, op: BinaryOperator::And, right } => {
            collect_conjuncts(left, out)?;
            collect_conjuncts(right, out)?;
            Ok(())
        }
        Expr::BinaryOp { op: BinaryOperator::Or, .. } => Err(PartitionCacheError::UnsupportedSyntax(
            "WHERE must be a conjunction of atomic predicates, no OR".into(),
        )),
        Expr::Nested(inner) => collect_conjuncts(inner, out),
        other => {
            out.push(other.clone());
            Ok(())
        }
    }
}

pub(crate) fn render_expr(
    expr: &Expr,
    alias_map: &std::collections::HashMap<String, String>,
) -> crate::Result<String> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => {
            if parts.len() != 2 {
                return Err(PartitionCacheError::UnsupportedSyntax(
                    "only alias-qualified column references are allowed".into(),
                ));
            }
            let alias = alias_map.get(&parts[0].value).cloned().unwrap_or_else(|| parts[0].value.clone());
            Ok(format!("{alias}.{}", parts[1].value))
        }
        Expr::Value(value) => render_value(&value.value),
        Expr::Nested(inner) => render_expr(inner, alias_map),
        Expr::UnaryOp { op, expr } => Ok(format!("{op}{}", render_expr(expr, alias_map)?)),
        Expr::BinaryOp { left, op, right } => {
            Ok(format!("{} {op} {}", render_expr(left, alias_map)?, render_expr(right, alias_map)?))
        }
        Expr::IsNull(inner) => Ok(format!("{} IS NULL", render_expr(inner, alias_map)?)),
        Expr::IsNotNull(inner) => Ok(format!("{} IS NOT NULL", render_expr(inner, alias_map)?)),
        other => Err(PartitionCacheError::UnsupportedSyntax(format!(
            "unsupported expression in fragment: {other}"
        ))),
    }
}

fn render_value(value: &Value) -> crate::Result<String> {
    match value {
        Value::Number(n, _) => Ok(format_numeric(n.parse::<f64>().unwrap_or(0.0))),
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => {
            Ok(format!("'{}'", s.replace('\'', "''")))
        }
        Value::Boolean(b) => Ok(b.to_string()),
        Value::Null => Ok("NULL".to_string()),
        other => Err(PartitionCacheError::UnsupportedSyntax(format!("unsupported literal: {other}"))),
    }
}

fn function_args(func: &sqlparser::ast::Function) -> crate::Result<Vec<Expr>> {
    match &func.args {
        sqlparser::ast::FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(e)) => Ok(e.clone()),
                _ => Err(PartitionCacheError::UnsupportedSyntax("unsupported function argument".into())),
            })
            .collect(),
        _ => Err(PartitionCacheError::UnsupportedSyntax("unsupported function argument list".into())),
    }
}

fn is_distance_predicate(func: &sqlparser::ast::Function) -> bool {
    let name = func.name.to_string().to_uppercase();
    name == "ST_DWITHIN" || name == "ST_DISTANCE_WITHIN"
}

fn literal_f64(expr: &Expr) -> crate::Result<f64> {
    match expr {
        Expr::Value(v) => match &v.value {
            Value::Number(n, _) => n
                .parse::<f64>()
                .map_err(|_| PartitionCacheError::UnsupportedSyntax(format!("not a numeric literal: {n}"))),
            other => Err(PartitionCacheError::UnsupportedSyntax(format!(
                "distance predicate argument must be a numeric literal, got {other}"
            ))),
        },
        Expr::UnaryOp { op: sqlparser::ast::UnaryOperator::Minus, expr } => Ok(-literal_f64(expr)?),
        other => Err(PartitionCacheError::UnsupportedSyntax(format!(
            "distance predicate argument must be a numeric literal, got {other}"
        ))),
    }
}

/// Buckets `value` to the nearest multiple of `step` (§4.1 step 3).
fn bucket(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

/// Formats a number with no trailing zeros and no leading `+` (§4.1 step 3).
fn format_numeric(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let s = format!("{n}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn hash_text(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_and_alias_variation_hash_identically() {
        let hasher = FragmentHasher::new();
        let a = hasher.hash_fragment("SELECT * FROM orders o WHERE o.city_id = 5").unwrap();
        let b = hasher
            .hash_fragment("SELECT   *   FROM    orders    x   WHERE   x.city_id    =    5")
            .unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn commutative_operand_order_hashes_identically() {
        let hasher = FragmentHasher::new();
        let a = hasher.hash_fragment("SELECT * FROM orders o WHERE o.city_id = 5").unwrap();
        let b = hasher.hash_fragment("SELECT * FROM orders o WHERE 5 = o.city_id").unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn table_order_does_not_affect_hash() {
        let hasher = FragmentHasher::new();
        let a = hasher
            .hash_fragment("SELECT * FROM orders o, shops s WHERE o.shop_id = s.id")
            .unwrap();
        let b = hasher
            .hash_fragment("SELECT * FROM shops s, orders o WHERE o.shop_id = s.id")
            .unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn between_expands_to_two_conjuncts() {
        let hasher = FragmentHasher::new();
        let a = hasher.hash_fragment("SELECT * FROM orders o WHERE o.amount BETWEEN 1 AND 10").unwrap();
        let b = hasher
            .hash_fragment("SELECT * FROM orders o WHERE o.amount >= 1 AND o.amount <= 10")
            .unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn distance_predicate_buckets_close_thresholds_together() {
        let hasher = FragmentHasher::with_bucket_step(1.0);
        let a = hasher
            .hash_fragment("SELECT * FROM shops s WHERE ST_DWithin(s.geom, s.center, 100.2)")
            .unwrap();
        let b = hasher
            .hash_fragment("SELECT * FROM shops s WHERE ST_DWithin(s.geom, s.center, 100.4)")
            .unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn cte_is_unsupported_syntax() {
        let hasher = FragmentHasher::new();
        let err = hasher
            .hash_fragment("WITH x AS (SELECT 1) SELECT * FROM x")
            .unwrap_err();
        assert!(matches!(err, PartitionCacheError::UnsupportedSyntax(_)));
    }

    #[test]
    fn or_in_where_is_unsupported_syntax() {
        let hasher = FragmentHasher::new();
        let err = hasher
            .hash_fragment("SELECT * FROM orders o WHERE o.a = 1 OR o.b = 2")
            .unwrap_err();
        assert!(matches!(err, PartitionCacheError::UnsupportedSyntax(_)));
    }

    #[test]
    fn group_by_is_unsupported_syntax() {
        let hasher = FragmentHasher::new();
        let err = hasher
            .hash_fragment("SELECT o.city_id FROM orders o GROUP BY o.city_id")
            .unwrap_err();
        assert!(matches!(err, PartitionCacheError::UnsupportedSyntax(_)));
    }
}
