//! Query Decomposer (C2), §4.2: enumerates the meaningful sub-SELECTs of a
//! user query whose partition-identifier sets can be cached and later
//! intersected.
//!
//! Builds an undirected table graph (nodes: FROM aliases, edges: WHERE atoms
//! touching ≥2 aliases), enumerates connected subsets bounded by
//! `min_component_size`/`max_component_size`, re-adds star-join tables to
//! every variant, and hands each variant's SQL to the [`crate::hasher`] for
//! a stable fragment hash (R7).

use std::collections::{BTreeSet, HashMap, HashSet};

use sqlparser::ast::{Expr, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::warn;

use crate::catalog::PartitionRegistry;
use crate::error::PartitionCacheError;
use crate::hasher::{self, FragmentHasher};

/// One enumerated decomposition variant, already passed through the hasher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub sql: String,
    pub hash: String,
    pub aliases: Vec<String>,
}

/// Tuning knobs for [`QueryDecomposer::decompose`] (§4.2 R1-R6).
#[derive(Debug, Clone)]
pub struct DecomposerConfig {
    /// R1: only emit connected-subgraph subsets.
    pub follow_graph: bool,
    /// R2: inclusive lower bound on `|subset|`.
    pub min_component_size: usize,
    /// R2: inclusive upper bound on `|subset|`; `None` is unbounded.
    pub max_component_size: Option<usize>,
    /// R3: warn (not error) when an alias in the variant has no bound
    /// partition-key column.
    pub suppress_missing_partition_warning: bool,
    /// R4: alias prefix that marks a star-join ("partition-join") table.
    pub star_join_prefix: String,
    /// R4: aliases explicitly designated as star-join tables.
    pub explicit_star_joins: HashSet<String>,
    /// R5: only emit variants whose atoms reference attributes already
    /// present in the original query. Always true in this implementation
    /// since variants are built exclusively from the original query's own
    /// atoms; kept as a config knob for forward compatibility.
    pub fix_attributes: bool,
    /// R6: attribute predicates (rendered atom text) to drop from every
    /// variant, producing a broader, more reusable fragment.
    pub drop_predicates: HashSet<String>,
    /// R6: when true, emit both the original-width and the broadened
    /// variant for each subset instead of only the broadened one.
    pub drop_additionally: bool,
    /// R6: extra raw predicate text injected per table alias.
    pub extra_predicates: HashMap<String, String>,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            follow_graph: true,
            min_component_size: 1,
            max_component_size: None,
            suppress_missing_partition_warning: false,
            star_join_prefix: "p0".to_string(),
            explicit_star_joins: HashSet::new(),
            fix_attributes: true,
            drop_predicates: HashSet::new(),
            drop_additionally: false,
            extra_predicates: HashMap::new(),
        }
    }
}

struct ParsedQuery {
    tables: Vec<(String, String)>, // (table_name, alias), in original FROM order
    atoms: Vec<Expr>,
}

/// Enumerates decomposition variants of a SELECT for a given partition key.
pub struct QueryDecomposer {
    dialect: GenericDialect,
    hasher: FragmentHasher,
    registry: PartitionRegistry,
}

impl QueryDecomposer {
    pub fn new(hasher: FragmentHasher, registry: PartitionRegistry) -> Self {
        Self { dialect: GenericDialect {}, hasher, registry }
    }

    pub fn decompose(
        &self,
        sql: &str,
        partition_key: &str,
        config: &DecomposerConfig,
    ) -> crate::Result<Vec<Fragment>> {
        let parsed = self.parse(sql)?;
        let alias_table: HashMap<String, String> =
            parsed.tables.iter().map(|(t, a)| (a.clone(), t.clone())).collect();

        let is_star_join = |alias: &str, degree: usize, total: usize, has_non_pk_atom: bool| {
            alias.starts_with(&config.star_join_prefix)
                || config.explicit_star_joins.contains(alias)
                || (degree == total.saturating_sub(1) && total > 1 && !has_non_pk_atom)
        };

        let all_aliases: Vec<String> = parsed.tables.iter().map(|(_, a)| a.clone()).collect();
        let edges = build_edges(&parsed.atoms);
        let degree = |alias: &str| edges.iter().filter(|(a, b)| a == alias || b == alias).count();
        let touches_only = |alias: &str| {
            parsed.atoms.iter().any(|atom| {
                let refs = atom_aliases(atom);
                refs.len() == 1 && refs.contains(alias) && !is_partition_equality(atom, partition_key)
            })
        };

        let star_joins: HashSet<String> = all_aliases
            .iter()
            .filter(|alias| {
                is_star_join(alias.as_str(), degree(alias.as_str()), all_aliases.len(), touches_only(alias.as_str()))
            })
            .cloned()
            .collect();

        // Connectivity is computed over the *full* table graph, star-join
        // tables included: their whole purpose is usually to be the hub that
        // connects otherwise-disconnected tables. Once a full connected
        // subset is found, the star-join aliases are projected back out to
        // get the "base enumeration" (R4); distinct full subsets can project
        // to the same base (e.g. `{u,p0}` and `{u,o,p0}` both touch `{u}`),
        // so variants are deduplicated by base set, not by full subset.
        let max_full_size = all_aliases.len();
        let full_subsets = enumerate_subsets(&all_aliases, &edges, config.follow_graph, 1, max_full_size);

        let max_base_size = config.max_component_size.unwrap_or(all_aliases.len());
        let mut seen_bases: BTreeSet<BTreeSet<String>> = BTreeSet::new();
        let mut bases = Vec::new();
        let star_joins_bt: BTreeSet<String> = star_joins.iter().cloned().collect();
        for full in &full_subsets {
            let base: BTreeSet<String> = full.difference(&star_joins_bt).cloned().collect();
            if base.is_empty() || base.len() < config.min_component_size || base.len() > max_base_size {
                continue;
            }
            if seen_bases.insert(base.clone()) {
                bases.push(base);
            }
        }

        let mut fragments = Vec::new();
        for subset in bases {
            let mut variant_aliases: Vec<String> = subset.iter().cloned().collect();
            variant_aliases.extend(star_joins.iter().cloned());
            variant_aliases.sort();

            let broadened = self.build_variant(
                &parsed,
                &alias_table,
                &variant_aliases,
                &subset,
                &star_joins,
                partition_key,
                &config.drop_predicates,
                &config.extra_predicates,
                config,
            )?;
            fragments.push(broadened);

            if config.drop_additionally && !config.drop_predicates.is_empty() {
                let original = self.build_variant(
                    &parsed,
                    &alias_table,
                    &variant_aliases,
                    &subset,
                    &star_joins,
                    partition_key,
                    &HashSet::new(),
                    &config.extra_predicates,
                    config,
                )?;
                fragments.push(original);
            }
        }

        fragments.sort_by(|a, b| (a.aliases.len(), &a.sql).cmp(&(b.aliases.len(), &b.sql)));
        fragments.dedup_by(|a, b| a.hash == b.hash);
        Ok(fragments)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_variant(
        &self,
        parsed: &ParsedQuery,
        alias_table: &HashMap<String, String>,
        variant_aliases: &[String],
        base_subset: &BTreeSet<String>,
        star_joins: &HashSet<String>,
        partition_key: &str,
        drop_predicates: &HashSet<String>,
        extra_predicates: &HashMap<String, String>,
        config: &DecomposerConfig,
    ) -> crate::Result<Fragment> {
        let variant_set: HashSet<&String> = variant_aliases.iter().collect();
        fn table_of<'a>(alias_table: &'a HashMap<String, String>, alias: &'a str) -> &'a str {
            alias_table.get(alias).map(|s| s.as_str()).unwrap_or(alias)
        }

        let mut atom_texts: Vec<String> = parsed
            .atoms
            .iter()
            .filter(|atom| atom_aliases(atom).iter().all(|a| variant_set.contains(a)))
            .map(|atom| hasher::render_expr(atom, &HashMap::new()))
            .collect::<crate::Result<Vec<_>>>()?;
        atom_texts.retain(|text| !drop_predicates.contains(text));

        for alias in variant_aliases {
            if let Some(extra) = extra_predicates.get(alias) {
                atom_texts.push(extra.clone());
            }
        }

        // R4: re-add star-join tables with partition-key equijoins to every
        // other alias in the subset.
        for star_alias in star_joins {
            for other in base_subset {
                let star_col = self
                    .registry
                    .column_in(partition_key, table_of(alias_table, star_alias))
                    .unwrap_or_else(|| partition_key.to_string());
                let other_col = self
                    .registry
                    .column_in(partition_key, table_of(alias_table, other))
                    .unwrap_or_else(|| partition_key.to_string());
                atom_texts.push(format!("{star_alias}.{star_col} = {other}.{other_col}"));
            }
        }
        atom_texts.sort();
        atom_texts.dedup();

        let p_alias: String = variant_aliases
            .iter()
            .find(|alias| self.registry.column_in(partition_key, table_of(alias_table, alias)).is_some())
            .map(|alias| alias.to_string())
            .or_else(|| variant_aliases.first().cloned())
            .ok_or_else(|| PartitionCacheError::Internal("empty variant".into()))?;

        if !config.suppress_missing_partition_warning {
            for alias in variant_aliases {
                if self.registry.column_in(partition_key, table_of(alias_table, alias)).is_none() {
                    warn!(alias = %alias, partition_key = %partition_key, "decomposer: alias lacks a bound partition-key column");
                }
            }
        }
        let p_column = self
            .registry
            .column_in(partition_key, table_of(alias_table, &p_alias))
            .unwrap_or_else(|| partition_key.to_string());

        let from_sql = variant_aliases
            .iter()
            .map(|alias| format!("{} {alias}", table_of(alias_table, alias)))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("SELECT DISTINCT {p_alias}.{p_column} FROM {from_sql}");
        if !atom_texts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&atom_texts.join(" AND "));
        }

        let canonical = self.hasher.hash_fragment(&sql)?;
        Ok(Fragment { sql, hash: canonical.hash, aliases: variant_aliases.to_vec() })
    }

    fn parse(&self, sql: &str) -> crate::Result<ParsedQuery> {
        let statements = Parser::parse_sql(&self.dialect, sql)
            .map_err(|e| PartitionCacheError::UnsupportedSyntax(e.to_string()))?;
        let Some(Statement::Query(query)) = statements.into_iter().next() else {
            return Err(PartitionCacheError::UnsupportedSyntax("expected a single SELECT".into()));
        };
        let SetExpr::Select(select) = *query.body else {
            return Err(PartitionCacheError::UnsupportedSyntax("expected a plain SELECT".into()));
        };
        let tables = hasher::extract_base_tables(&select.from)?;
        let mut atoms = Vec::new();
        if let Some(selection) = &select.selection {
            hasher::collect_conjuncts(selection, &mut atoms)?;
        }
        Ok(ParsedQuery { tables, atoms })
    }
}

fn atom_aliases(expr: &Expr) -> HashSet<String> {
    let mut out = HashSet::new();
    collect_idents(expr, &mut out);
    out
}

fn collect_idents(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
            out.insert(parts[0].value.clone());
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_idents(left, out);
            collect_idents(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::IsNull(expr) | Expr::IsNotNull(expr) => {
            collect_idents(expr, out);
        }
        Expr::Between { expr, low, high, .. } => {
            collect_idents(expr, out);
            collect_idents(low, out);
            collect_idents(high, out);
        }
        Expr::Function(func) => {
            if let sqlparser::ast::FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    if let sqlparser::ast::FunctionArg::Unnamed(sqlparser::ast::FunctionArgExpr::Expr(e)) = arg {
                        collect_idents(e, out);
                    }
                }
            }
        }
        _ => {}
    }
}

fn is_partition_equality(atom: &Expr, partition_key: &str) -> bool {
    if let Expr::BinaryOp { left, op: sqlparser::ast::BinaryOperator::Eq, right } = atom {
        let text = format!("{left} {right}");
        return text.to_lowercase().contains(&partition_key.to_lowercase());
    }
    false
}

/// Edges between aliases co-mentioned by a single WHERE atom (§4.2 "Model").
fn build_edges(atoms: &[Expr]) -> Vec<(String, String)> {
    let mut edges = BTreeSet::new();
    for atom in atoms {
        let aliases: Vec<String> = atom_aliases(atom).into_iter().collect();
        for i in 0..aliases.len() {
            for j in (i + 1)..aliases.len() {
                let (a, b) = if aliases[i] < aliases[j] {
                    (aliases[i].clone(), aliases[j].clone())
                } else {
                    (aliases[j].clone(), aliases[i].clone())
                };
                edges.insert((a, b));
            }
        }
    }
    edges.into_iter().collect()
}

/// Enumerates subsets of `aliases` in deterministic (size, then
/// lexicographic) order, filtering to connected components when
/// `follow_graph` is set (R1).
fn enumerate_subsets(
    aliases: &[String],
    edges: &[(String, String)],
    follow_graph: bool,
    min_size: usize,
    max_size: usize,
) -> Vec<BTreeSet<String>> {
    let n = aliases.len();
    let mut out = Vec::new();
    for mask in 1u64..(1u64 << n) {
        let subset: BTreeSet<String> =
            (0..n).filter(|i| mask & (1 << i) != 0).map(|i| aliases[i].clone()).collect();
        if subset.len() < min_size || subset.len() > max_size {
            continue;
        }
        if follow_graph && !is_connected(&subset, edges) {
            continue;
        }
        out.push(subset);
    }
    out.sort_by(|a, b| (a.len(), a.iter().cloned().collect::<Vec<_>>()).cmp(&(b.len(), b.iter().cloned().collect())));
    out
}

fn is_connected(subset: &BTreeSet<String>, edges: &[(String, String)]) -> bool {
    if subset.len() <= 1 {
        return true;
    }
    let mut visited = BTreeSet::new();
    let start = subset.iter().next().unwrap().clone();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !visited.insert(node.clone()) {
            continue;
        }
        for (a, b) in edges {
            let neighbor = if a == &node && subset.contains(b) {
                Some(b.clone())
            } else if b == &node && subset.contains(a) {
                Some(a.clone())
            } else {
                None
            };
            if let Some(neighbor) = neighbor {
                if !visited.contains(&neighbor) {
                    stack.push(neighbor);
                }
            }
        }
    }
    visited == *subset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Datatype;

    fn registry() -> PartitionRegistry {
        let reg = PartitionRegistry::new();
        reg.register("city_id", Datatype::Integer).unwrap();
        reg.bind_column("city_id", "users", "city_id").unwrap();
        reg.bind_column("city_id", "orders", "city_id").unwrap();
        reg.bind_column("city_id", "p0_city", "city_id").unwrap();
        reg
    }

    #[test]
    fn single_table_has_exactly_one_variant() {
        let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry());
        let fragments = decomposer
            .decompose("SELECT * FROM users u WHERE u.age > 25", "city_id", &DecomposerConfig::default())
            .unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].aliases, vec!["u".to_string()]);
    }

    #[test]
    fn disconnected_tables_are_not_joined_into_one_variant() {
        let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry());
        let fragments = decomposer
            .decompose(
                "SELECT * FROM users u, orders o WHERE u.age > 25 AND o.total > 10",
                "city_id",
                &DecomposerConfig::default(),
            )
            .unwrap();
        // two singleton variants only; {u,o} is not connected (no shared-alias atom)
        assert_eq!(fragments.len(), 2);
    }

    #[test]
    fn star_join_table_is_readded_to_every_variant() {
        let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry());
        let sql = "SELECT * FROM users u, orders o, p0_city p0 \
                   WHERE u.city_id = p0.city_id AND o.city_id = p0.city_id \
                   AND u.age > 25 AND o.total > 100";
        let fragments = decomposer.decompose(sql, "city_id", &DecomposerConfig::default()).unwrap();
        // base aliases (excluding star join p0): {u}, {o}, {u,o} if connected.
        // every variant must include p0.
        assert!(fragments.iter().all(|f| f.aliases.contains(&"p0".to_string())));
        assert!(fragments.iter().any(|f| f.aliases == vec!["p0".to_string(), "u".to_string()]));
        assert!(fragments.iter().any(|f| f.aliases == vec!["o".to_string(), "p0".to_string()]));
    }

    #[test]
    fn decomposition_is_deterministic_across_calls() {
        let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry());
        let sql = "SELECT * FROM users u, orders o WHERE u.city_id = o.city_id";
        let a = decomposer.decompose(sql, "city_id", &DecomposerConfig::default()).unwrap();
        let b = decomposer.decompose(sql, "city_id", &DecomposerConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn size_bound_excludes_multi_table_variants() {
        let decomposer = QueryDecomposer::new(FragmentHasher::new(), registry());
        let mut config = DecomposerConfig::default();
        config.max_component_size = Some(1);
        let sql = "SELECT * FROM users u, orders o WHERE u.city_id = o.city_id AND u.age > 25 AND o.total > 10";
        let fragments = decomposer.decompose(sql, "city_id", &config).unwrap();
        assert!(!fragments.is_empty());
        assert!(fragments.iter().all(|f| f.aliases.len() == 1));
    }
}
