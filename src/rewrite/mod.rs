//! Query Rewriter (C5), §4.5: injects a partition-identifier restriction
//! into a user SELECT via one of four integration methods, preserving the
//! original SELECT list, GROUP BY, ORDER BY, and LIMIT.

use crate::cache::Identifier;
use crate::intersect::Intersection;

/// Which integration method to use when restricting a query (§4.5 M1-M4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMethod {
    /// M1: `AND <alias>.<pk> IN (v1, v2, ...)`. Best for small sets.
    InList,
    /// M2: `AND <alias>.<pk> IN (<lazy subquery>)`. Requires a lazy form.
    InSubquery,
    /// M3: materialize into `_pc_tmp`, then `IN (SELECT pk FROM _pc_tmp)`.
    TempTableIn,
    /// M4: as M3 but `JOIN _pc_tmp ON ...` in the FROM clause.
    TempTableJoin,
}

/// Statement(s) needed to apply a temp-table integration method (M3/M4)
/// before the rewritten SELECT is issued.
#[derive(Debug, Clone, PartialEq)]
pub struct TempTablePlan {
    pub create_and_populate_sql: Vec<String>,
    pub index_sql: Option<String>,
    pub analyze_sql: Option<String>,
}

/// Outcome of [`QueryRewriter::rewrite`].
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteResult {
    pub sql: String,
    pub temp_table: Option<TempTablePlan>,
    /// Whether the restriction actually narrowed the query (false for a
    /// pass-through on a `None`-lazy / no-information result).
    pub enhanced: bool,
    pub hits: usize,
}

const TEMP_TABLE_NAME: &str = "_pc_tmp";

/// Rewrites a user SELECT to restrict it to a partition-identifier
/// intersection (§4.5).
pub struct QueryRewriter {
    method: IntegrationMethod,
}

impl QueryRewriter {
    pub fn new(method: IntegrationMethod) -> Self {
        Self { method }
    }

    /// `user_sql` is the original SELECT, unparsed: the rewriter only needs
    /// to know where the WHERE clause ends to append a restriction, so it
    /// treats the statement as an opaque string plus the caller-supplied
    /// `alias`/`partition_column` describing where to attach it, matching
    /// the contract's "inject restriction... via chosen method" framing —
    /// SELECT list, GROUP BY, ORDER BY, and LIMIT are never touched.
    pub fn rewrite(
        &self,
        user_sql: &str,
        alias: &str,
        partition_column: &str,
        intersection: &Intersection,
    ) -> RewriteResult {
        match intersection {
            Intersection::Materialized(result) if result.hits == 0 => {
                // §4.3: all-miss intersection carries no information.
                RewriteResult { sql: user_sql.to_string(), temp_table: None, enhanced: false, hits: 0 }
            }
            Intersection::Materialized(result) if result.ids.is_empty() => {
                // Empty set (possibly from a null-excluded partition):
                // short-circuit per §4.5 edge cases.
                RewriteResult {
                    sql: short_circuit(user_sql),
                    temp_table: None,
                    enhanced: true,
                    hits: result.hits,
                }
            }
            Intersection::Materialized(result) => {
                self.rewrite_with_ids(user_sql, alias, partition_column, &result.ids, result.hits)
            }
            Intersection::Lazy { subquery_sql, hits } => {
                self.rewrite_with_lazy(user_sql, alias, partition_column, subquery_sql, *hits)
            }
        }
    }

    /// A `None` lazy result with zero hits: no information at all, return
    /// the original query unchanged (§4.5 edge cases, P8).
    pub fn passthrough(&self, user_sql: &str) -> RewriteResult {
        RewriteResult { sql: user_sql.to_string(), temp_table: None, enhanced: false, hits: 0 }
    }

    fn rewrite_with_ids(
        &self,
        user_sql: &str,
        alias: &str,
        partition_column: &str,
        ids: &[Identifier],
        hits: usize,
    ) -> RewriteResult {
        match self.method {
            IntegrationMethod::InList | IntegrationMethod::InSubquery => {
                let list = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
                RewriteResult {
                    sql: append_restriction(user_sql, &format!("{alias}.{partition_column} IN ({list})")),
                    temp_table: None,
                    enhanced: true,
                    hits,
                }
            }
            IntegrationMethod::TempTableIn => {
                let plan = materialize_plan(ids);
                RewriteResult {
                    sql: append_restriction(
                        user_sql,
                        &format!(
                            "{alias}.{partition_column} IN (SELECT {partition_column} FROM {TEMP_TABLE_NAME})"
                        ),
                    ),
                    temp_table: Some(plan),
                    enhanced: true,
                    hits,
                }
            }
            IntegrationMethod::TempTableJoin => {
                let plan = materialize_plan(ids);
                RewriteResult {
                    sql: append_join(
                        user_sql,
                        &format!(
                            "JOIN {TEMP_TABLE_NAME} ON {alias}.{partition_column} = {TEMP_TABLE_NAME}.{partition_column}"
                        ),
                    ),
                    temp_table: Some(plan),
                    enhanced: true,
                    hits,
                }
            }
        }
    }

    fn rewrite_with_lazy(
        &self,
        user_sql: &str,
        alias: &str,
        partition_column: &str,
        subquery_sql: &str,
        hits: usize,
    ) -> RewriteResult {
        if hits == 0 {
            return self.passthrough(user_sql);
        }
        match self.method {
            IntegrationMethod::TempTableIn | IntegrationMethod::TempTableJoin => {
                // Materializing a lazy subquery into a temp table still goes
                // through the same DDL shape as the id-list path; the values
                // are produced by executing `subquery_sql`, not listed here.
                let plan = TempTablePlan {
                    create_and_populate_sql: vec![format!(
                        "CREATE TEMPORARY TABLE {TEMP_TABLE_NAME} ({partition_column}) ON COMMIT DROP AS {subquery_sql}"
                    )],
                    index_sql: Some(format!("CREATE INDEX ON {TEMP_TABLE_NAME} ({partition_column})")),
                    analyze_sql: Some(format!("ANALYZE {TEMP_TABLE_NAME}")),
                };
                let sql = if self.method == IntegrationMethod::TempTableJoin {
                    append_join(
                        user_sql,
                        &format!(
                            "JOIN {TEMP_TABLE_NAME} ON {alias}.{partition_column} = {TEMP_TABLE_NAME}.{partition_column}"
                        ),
                    )
                } else {
                    append_restriction(
                        user_sql,
                        &format!(
                            "{alias}.{partition_column} IN (SELECT {partition_column} FROM {TEMP_TABLE_NAME})"
                        ),
                    )
                };
                RewriteResult { sql, temp_table: Some(plan), enhanced: true, hits }
            }
            IntegrationMethod::InList | IntegrationMethod::InSubquery => RewriteResult {
                sql: append_restriction(user_sql, &format!("{alias}.{partition_column} IN ({subquery_sql})")),
                temp_table: None,
                enhanced: true,
                hits,
            },
        }
    }
}

fn materialize_plan(ids: &[Identifier]) -> TempTablePlan {
    let values = ids.iter().map(|id| format!("({id})")).collect::<Vec<_>>().join(", ");
    TempTablePlan {
        create_and_populate_sql: vec![
            format!("CREATE TEMPORARY TABLE {TEMP_TABLE_NAME} (id) ON COMMIT DROP"),
            format!("INSERT INTO {TEMP_TABLE_NAME} VALUES {values}"),
        ],
        index_sql: Some(format!("CREATE INDEX ON {TEMP_TABLE_NAME} (id)")),
        analyze_sql: Some(format!("ANALYZE {TEMP_TABLE_NAME}")),
    }
}

/// Appends `predicate` to the query's WHERE clause, inserting one if
/// absent, without disturbing GROUP BY/ORDER BY/LIMIT that follow it.
fn append_restriction(sql: &str, predicate: &str) -> String {
    let (head, tail) = split_before_tail_clauses(sql);
    if let Some(where_pos) = find_keyword(&head, "WHERE") {
        let (before, after) = head.split_at(where_pos + 5);
        format!("{before} ({after}) AND {predicate}{tail}")
    } else {
        format!("{head} WHERE {predicate}{tail}")
    }
}

fn append_join(sql: &str, join_clause: &str) -> String {
    let (head, tail) = split_before_tail_clauses(sql);
    if let Some(where_pos) = find_keyword(&head, "WHERE") {
        let (before, after) = head.split_at(where_pos);
        format!("{before} {join_clause} {after}{tail}")
    } else {
        format!("{head} {join_clause}{tail}")
    }
}

/// Splits off a trailing GROUP BY/ORDER BY/LIMIT suffix so restrictions are
/// never inserted after it.
fn split_before_tail_clauses(sql: &str) -> (String, String) {
    let upper = sql.to_uppercase();
    let mut cut = sql.len();
    for kw in ["GROUP BY", "ORDER BY", "LIMIT"] {
        if let Some(pos) = upper.find(kw) {
            cut = cut.min(pos);
        }
    }
    (sql[..cut].trim_end().to_string(), sql[cut..].to_string())
}

fn find_keyword(sql: &str, keyword: &str) -> Option<usize> {
    sql.to_uppercase().find(keyword)
}

/// Returns a query guaranteed to yield zero rows on any database state
/// (§4.5 edge cases, P7), preserving SELECT list/GROUP BY/ORDER BY/LIMIT.
fn short_circuit(sql: &str) -> String {
    append_restriction(sql, "FALSE")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::IntersectionResult;

    fn ids(vals: &[i64]) -> Vec<Identifier> {
        vals.iter().map(|v| Identifier::Integer(*v)).collect()
    }

    #[test]
    fn in_list_appends_to_existing_where() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InList);
        let intersection = Intersection::Materialized(IntersectionResult { ids: ids(&[3, 4, 5]), hits: 2 });
        let result = rewriter.rewrite("SELECT * FROM orders o WHERE o.total > 10", "o", "city_id", &intersection);
        assert!(result.sql.contains("city_id IN (3, 4, 5)"));
        assert!(result.sql.contains("o.total > 10"));
        assert!(result.enhanced);
    }

    #[test]
    fn in_list_inserts_where_when_absent() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InList);
        let intersection = Intersection::Materialized(IntersectionResult { ids: ids(&[1]), hits: 1 });
        let result = rewriter.rewrite("SELECT * FROM orders o", "o", "city_id", &intersection);
        assert!(result.sql.contains("WHERE o.city_id IN (1)"));
    }

    #[test]
    fn empty_set_short_circuits_to_false() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InList);
        let intersection = Intersection::Materialized(IntersectionResult { ids: vec![], hits: 2 });
        let result = rewriter.rewrite("SELECT * FROM orders o", "o", "city_id", &intersection);
        assert!(result.sql.contains("FALSE"));
        assert!(result.enhanced);
    }

    #[test]
    fn all_miss_passes_through_unchanged() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InList);
        let intersection = Intersection::Materialized(IntersectionResult { ids: vec![], hits: 0 });
        let result = rewriter.rewrite("SELECT * FROM orders o", "o", "city_id", &intersection);
        assert_eq!(result.sql, "SELECT * FROM orders o");
        assert!(!result.enhanced);
    }

    #[test]
    fn preserves_group_by_order_by_and_limit() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InList);
        let intersection = Intersection::Materialized(IntersectionResult { ids: ids(&[1, 2]), hits: 1 });
        let sql = "SELECT o.city_id, COUNT(*) FROM orders o WHERE o.total > 10 GROUP BY o.city_id ORDER BY o.city_id LIMIT 5";
        let result = rewriter.rewrite(sql, "o", "city_id", &intersection);
        assert!(result.sql.contains("GROUP BY o.city_id ORDER BY o.city_id LIMIT 5"));
        assert!(result.sql.contains("city_id IN (1, 2)"));
    }

    #[test]
    fn temp_table_join_method_produces_ddl_and_join_clause() {
        let rewriter = QueryRewriter::new(IntegrationMethod::TempTableJoin);
        let intersection = Intersection::Materialized(IntersectionResult { ids: ids(&[1, 2, 3]), hits: 1 });
        let result = rewriter.rewrite("SELECT * FROM orders o WHERE o.total > 10", "o", "city_id", &intersection);
        assert!(result.sql.contains("JOIN _pc_tmp"));
        assert!(result.temp_table.is_some());
    }

    #[test]
    fn lazy_with_zero_hits_is_a_passthrough() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InSubquery);
        let intersection = Intersection::Lazy { subquery_sql: "SELECT 1".into(), hits: 0 };
        let result = rewriter.rewrite("SELECT * FROM orders o", "o", "city_id", &intersection);
        assert_eq!(result.sql, "SELECT * FROM orders o");
        assert!(!result.enhanced);
    }

    #[test]
    fn lazy_in_subquery_embeds_subquery_sql() {
        let rewriter = QueryRewriter::new(IntegrationMethod::InSubquery);
        let intersection = Intersection::Lazy { subquery_sql: "SELECT id FROM pc_entries".into(), hits: 2 };
        let result = rewriter.rewrite("SELECT * FROM orders o", "o", "city_id", &intersection);
        assert!(result.sql.contains("city_id IN (SELECT id FROM pc_entries)"));
    }
}
