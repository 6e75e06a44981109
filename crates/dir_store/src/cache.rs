//! Compiled filter memo owned by one store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use kestrel_dir_core::{CompiledQuery, DirResult};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

#[derive(Default)]
struct Inner {
    queries: HashMap<String, CompiledQuery>,
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
}

/// Bounded FIFO cache keyed by the canonical filter string. Entries are
/// stored unresolved; each search resolves its own copy.
pub struct QueryCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Only memoized values live here, so a poisoned guard is still usable.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_or_insert<F>(&self, key: &str, compile: F) -> DirResult<CompiledQuery>
    where
        F: FnOnce() -> DirResult<CompiledQuery>,
    {
        {
            let mut inner = self.lock();
            if let Some(query) = inner.queries.get(key).cloned() {
                inner.hits += 1;
                return Ok(query);
            }
            inner.misses += 1;
        }

        let query = compile()?;
        if self.capacity == 0 {
            return Ok(query);
        }

        let mut inner = self.lock();
        if !inner.queries.contains_key(key) {
            while inner.order.len() >= self.capacity {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.queries.remove(&oldest);
            }
            inner.order.push_back(key.to_string());
            inner.queries.insert(key.to_string(), query.clone());
        }
        Ok(query)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.queries.len(),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.queries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::QueryCache;
    use kestrel_dir_core::{CompileOptions, Filter, SchemaCatalog, compile};

    fn compiled(catalog: &SchemaCatalog, raw: &str) -> kestrel_dir_core::CompiledQuery {
        let filter = Filter::parse(raw).expect("filter");
        compile(catalog, &filter, &CompileOptions::default()).expect("compile")
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let catalog = SchemaCatalog::builtin().expect("catalog");
        let cache = QueryCache::new(4);
        let first = cache
            .get_or_insert("(cn=a)", || Ok(compiled(&catalog, "(cn=a)")))
            .expect("first");
        let second = cache
            .get_or_insert("(cn=a)", || panic!("should be cached"))
            .expect("second");
        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
    }

    #[test]
    fn evicts_oldest_when_full() {
        let catalog = SchemaCatalog::builtin().expect("catalog");
        let cache = QueryCache::new(2);
        for raw in ["(cn=a)", "(cn=b)", "(cn=c)"] {
            cache
                .get_or_insert(raw, || Ok(compiled(&catalog, raw)))
                .expect("insert");
        }
        assert_eq!(cache.stats().size, 2);
        let mut recompiled = false;
        cache
            .get_or_insert("(cn=a)", || {
                recompiled = true;
                Ok(compiled(&catalog, "(cn=a)"))
            })
            .expect("reinsert");
        assert!(recompiled);
    }

    #[test]
    fn compile_errors_are_not_cached() {
        let cache = QueryCache::new(2);
        let result = cache.get_or_insert("bad", || {
            Err(kestrel_dir_core::DirError::invalid_filter("too deep"))
        });
        assert!(result.is_err());
        assert_eq!(cache.stats().size, 0);
    }
}
