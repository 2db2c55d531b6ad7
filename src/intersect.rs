//! Lazy Intersector (C4), §4.4: decides whether an intersection over a set
//! of fragment hashes can be expressed as a database-side subquery or must
//! be materialized client-side, and normalizes the "what to do with a miss"
//! policy described in §4.3's "Semantics of intersection over mixed
//! hit/miss" paragraph.

use crate::cache::{CacheStore, Identifier, IntersectionResult};

/// Either a materialized identifier set or a SQL expression the caller's
/// database can execute directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Intersection {
    Materialized(IntersectionResult),
    Lazy { subquery_sql: String, hits: usize },
}

impl Intersection {
    pub fn hits(&self) -> usize {
        match self {
            Intersection::Materialized(r) => r.hits,
            Intersection::Lazy { hits, .. } => *hits,
        }
    }

    pub fn ids(&self) -> Option<&[Identifier]> {
        match self {
            Intersection::Materialized(r) => Some(&r.ids),
            Intersection::Lazy { .. } => None,
        }
    }
}

/// Wraps a [`CacheStore`] and prefers its lazy form, falling back to
/// materialized intersection when the back-end cannot express one (§4.4
/// "For out-of-database back-ends, return None").
pub struct LazyIntersector<'a, S: CacheStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: CacheStore + ?Sized> LazyIntersector<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn intersect(
        &self,
        partition_key: &str,
        fragment_hashes: &[String],
    ) -> crate::Result<Intersection> {
        if self.store.capabilities().lazy_intersection {
            let lazy = self.store.intersect_lazy(partition_key, fragment_hashes).await?;
            if let Some(subquery_sql) = lazy.subquery_sql {
                return Ok(Intersection::Lazy { subquery_sql, hits: lazy.hits });
            }
        }
        Ok(Intersection::Materialized(self.store.intersect(partition_key, fragment_hashes).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backends::array::SortedArrayStore;
    use crate::cache::Datatype;

    #[tokio::test]
    async fn falls_back_to_materialized_when_backend_has_no_lazy_form() {
        let store = SortedArrayStore::new();
        store.register_partition("city_id", Datatype::Integer).await.unwrap();
        store.put_set("city_id", "h1", vec![Identifier::Integer(1), Identifier::Integer(2)]).await.unwrap();

        let intersector = LazyIntersector::new(&store);
        let result = intersector.intersect("city_id", &["h1".to_string()]).await.unwrap();
        assert!(matches!(result, Intersection::Materialized(_)));
        assert_eq!(result.hits(), 1);
    }

    #[tokio::test]
    async fn empty_fragment_list_is_zero_hits() {
        let store = SortedArrayStore::new();
        store.register_partition("city_id", Datatype::Integer).await.unwrap();
        let intersector = LazyIntersector::new(&store);
        let result = intersector.intersect("city_id", &[]).await.unwrap();
        assert_eq!(result.hits(), 0);
    }
}
