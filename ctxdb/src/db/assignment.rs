//! Context to database assignments and their cache.

use arc_swap::ArcSwapOption;
use moka::future::Cache;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::config::AssignmentCacheConfig;
use crate::db::driver::AssignmentRow;
use crate::db::errors::{DbError, Result};
use crate::types::{ContextId, PoolId, ServerId};

/// Where a context lives: read pool, write pool and schema, plus the last
/// replication counter value written through this process.
pub struct Assignment {
    pub context_id: ContextId,
    pub server_id: ServerId,
    pub read_pool_id: PoolId,
    pub write_pool_id: PoolId,
    pub schema: String,
    transaction: ArcSwapOption<i64>,
}

impl Assignment {
    pub fn new(context_id: ContextId, server_id: ServerId, row: AssignmentRow) -> Self {
        Self {
            context_id,
            server_id,
            read_pool_id: row.read_pool_id,
            write_pool_id: row.write_pool_id,
            schema: row.schema,
            transaction: ArcSwapOption::from(None),
        }
    }

    /// Pool serving reads or writes for this context
    pub fn pool_id(&self, write: bool) -> PoolId {
        if write { self.write_pool_id } else { self.read_pool_id }
    }

    /// Whether reads are served by a separate replica
    pub fn has_replica(&self) -> bool {
        self.read_pool_id != self.write_pool_id
    }

    /// Last known counter value, `None` until the first write through this process
    pub fn transaction(&self) -> Option<i64> {
        self.transaction.load().as_deref().copied()
    }

    /// Remember a counter value read back from the master. Older values
    /// (in wraparound order) never replace newer ones.
    pub fn update_transaction(&self, value: i64) {
        self.transaction.rcu(|current| match current.as_deref() {
            Some(known) if value.wrapping_sub(*known) <= 0 => current.clone(),
            _ => Some(Arc::new(value)),
        });
    }
}

impl fmt::Debug for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assignment")
            .field("context_id", &self.context_id)
            .field("server_id", &self.server_id)
            .field("read_pool_id", &self.read_pool_id)
            .field("write_pool_id", &self.write_pool_id)
            .field("schema", &self.schema)
            .field("transaction", &self.transaction())
            .finish()
    }
}

/// Cache of resolved assignments. Concurrent lookups of the same context share
/// one config database query.
#[derive(Clone)]
pub struct ContextAssignments {
    cache: Cache<ContextId, Arc<Assignment>>,
}

impl ContextAssignments {
    pub fn new(config: &AssignmentCacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_idle(config.time_to_idle)
            .build();
        Self { cache }
    }

    /// Cached assignment of a context, loading it with `load` on a miss
    pub async fn get_or_load<F>(&self, context_id: ContextId, load: F) -> Result<Arc<Assignment>>
    where
        F: Future<Output = Result<Assignment>>,
    {
        self.cache
            .try_get_with(context_id, async move { load.await.map(Arc::new) })
            .await
            .map_err(|e| match Arc::try_unwrap(e) {
                Ok(err) => err,
                Err(shared) => match shared.as_ref() {
                    DbError::NoAssignment { context_id } => DbError::NoAssignment { context_id: *context_id },
                    _ => DbError::AssignmentLookup {
                        context_id,
                        source: shared,
                    },
                },
            })
    }

    /// Cached assignment without loading
    pub async fn cached(&self, context_id: ContextId) -> Option<Arc<Assignment>> {
        self.cache.get(&context_id).await
    }

    pub async fn invalidate(&self, context_ids: &[ContextId]) {
        for context_id in context_ids {
            self.cache.invalidate(context_id).await;
        }
        debug!(count = context_ids.len(), "Invalidated context assignments");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row() -> AssignmentRow {
        AssignmentRow {
            read_pool_id: 2,
            write_pool_id: 1,
            schema: "ctx_42".to_string(),
        }
    }

    #[test]
    fn test_transaction_only_moves_forward() {
        let assignment = Assignment::new(42, 1, row());
        assert_eq!(assignment.transaction(), None);
        assert!(assignment.has_replica());
        assert_eq!(assignment.pool_id(false), 2);
        assert_eq!(assignment.pool_id(true), 1);

        assignment.update_transaction(10);
        assignment.update_transaction(9);
        assert_eq!(assignment.transaction(), Some(10));
        assignment.update_transaction(11);
        assert_eq!(assignment.transaction(), Some(11));

        // wrapping past i64::MAX still counts as newer
        assignment.update_transaction(i64::MAX);
        assignment.update_transaction(i64::MIN);
        assert_eq!(assignment.transaction(), Some(i64::MIN));
    }

    #[tokio::test]
    async fn test_cache_loads_once() {
        let assignments = ContextAssignments::new(&AssignmentCacheConfig::default());
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let assignment = assignments
                .get_or_load(42, async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(Assignment::new(42, 1, row()))
                })
                .await
                .unwrap();
            assert_eq!(assignment.schema, "ctx_42");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        // the cached instance carries the counter between lookups
        assignments.cached(42).await.unwrap().update_transaction(5);
        let again = assignments
            .get_or_load(42, async { Ok(Assignment::new(42, 1, row())) })
            .await
            .unwrap();
        assert_eq!(again.transaction(), Some(5));

        assignments.invalidate(&[42]).await;
        assert!(assignments.cached(42).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_context_is_not_cached() {
        let assignments = ContextAssignments::new(&AssignmentCacheConfig::default());

        let err = assignments
            .get_or_load(7, async { Err(DbError::NoAssignment { context_id: 7 }) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoAssignment { context_id: 7 }));
        assert!(assignments.cached(7).await.is_none());
    }
}
