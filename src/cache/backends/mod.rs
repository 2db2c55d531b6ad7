//! Concrete [`super::CacheStore`] realizations.
//!
//! | module | spec back-end family | in-database? |
//! |---|---|---|
//! | [`array`] | (a) sorted-array, typed | no (process-local reference impl) |
//! | [`bitstring`] | (b) fixed-width bitstring | no (process-local reference impl) |
//! | [`bitmap`] | (c) compressed bitmap | no (process-local reference impl) |
//! | [`kv`] | (d) external KV set/bitmap | yes, via a pluggable [`kv::KvBackend`] |
//! | [`dict`] | (e) rich-dict (serialized values, all datatypes) | yes, via embedded storage |
//! | [`postgres`] | (a)/(b)/(c) realized against a real database | yes |
//!
//! `array`/`bitstring`/`bitmap` are process-local reference implementations:
//! they implement the exact physical encoding the spec describes, but keep
//! the encoded values in memory rather than in a cache database, which is
//! what a unit/integration test suite needs without a live Postgres. The
//! [`postgres`] module realizes the same three encodings against an actual
//! database and is the one that can answer `intersect_lazy` with real SQL.

pub mod array;
pub mod bitmap;
pub mod bitstring;
pub mod dict;
pub mod kv;
pub mod postgres;

use crate::cache::{Datatype, Identifier};
use crate::error::PartitionCacheError;

/// Shared datatype-conflict check used by every back-end's
/// `register_partition`.
pub(crate) fn check_datatype(
    partition_key: &str,
    existing: Datatype,
    requested: Datatype,
) -> crate::Result<()> {
    if existing != requested {
        return Err(PartitionCacheError::DatatypeConflict {
            partition_key: partition_key.to_string(),
            expected: existing,
            actual: requested,
        });
    }
    Ok(())
}

/// Shared per-identifier datatype check used by every back-end's `put_set`.
pub(crate) fn check_ids_match(
    partition_key: &str,
    datatype: Datatype,
    ids: &[Identifier],
) -> crate::Result<()> {
    for id in ids {
        if id.datatype() != datatype {
            return Err(PartitionCacheError::DatatypeConflict {
                partition_key: partition_key.to_string(),
                expected: datatype,
                actual: id.datatype(),
            });
        }
    }
    Ok(())
}

/// Multi-way intersection over a batch of sorted id vectors. Repeated
/// two-way intersection over the smallest pair first, per §4.3(a)'s
/// "for four or more inputs" note, generalized to any count >= 2.
pub(crate) fn intersect_sorted(mut sets: Vec<Vec<Identifier>>) -> Vec<Identifier> {
    if sets.is_empty() {
        return Vec::new();
    }
    sets.sort_by_key(|s| s.len());
    let mut acc = sets.remove(0);
    for next in sets {
        acc = merge_intersect(&acc, &next);
        if acc.is_empty() {
            break;
        }
    }
    acc
}

fn merge_intersect(a: &[Identifier], b: &[Identifier]) -> Vec<Identifier> {
    let mut i = 0;
    let mut j = 0;
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].partial_cmp(&b[j]) {
            Some(std::cmp::Ordering::Less) => i += 1,
            Some(std::cmp::Ordering::Greater) => j += 1,
            Some(std::cmp::Ordering::Equal) => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
            None => {
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_sorted_handles_three_sets() {
        let a = vec![Identifier::Integer(1), Identifier::Integer(2), Identifier::Integer(3)];
        let b = vec![Identifier::Integer(2), Identifier::Integer(3), Identifier::Integer(4)];
        let c = vec![Identifier::Integer(3), Identifier::Integer(4)];
        let result = intersect_sorted(vec![a, b, c]);
        assert_eq!(result, vec![Identifier::Integer(3)]);
    }

    #[test]
    fn intersect_sorted_empty_input_is_empty() {
        assert_eq!(intersect_sorted(vec![]), Vec::<Identifier>::new());
    }
}
