//! In-memory [`EntityStore`] for processor tests.
//!
//! Changes made through a unit of work are staged and applied atomically on
//! commit, so concurrent units behave like independent transactions. Reads see
//! committed records plus the unit's own staged changes.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use entity_bridge_core::{BoxFuture, Entity, EntityStore, StoreError, UnitOfWork};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

type IdAllocator<E> = Box<dyn Fn() -> <E as Entity>::Id + Send + Sync>;

#[derive(Debug, Default)]
struct Failures {
    begin: usize,
    commit: usize,
}

struct Inner<E: Entity> {
    records: RwLock<Vec<E>>,
    allocator: Option<IdAllocator<E>>,
    latency: Option<Duration>,
    failures: Mutex<Failures>,
    commits: AtomicUsize,
}

/// In-memory entity storage with optional id assignment and failure injection.
///
/// Cloning shares the records.
///
/// # Example
///
/// ```ignore
/// let next = AtomicU64::new(42);
/// let store = InMemoryEntityStore::<Order>::new()
///     .with_id_allocator(move || next.fetch_add(1, Ordering::SeqCst));
/// ```
pub struct InMemoryEntityStore<E: Entity> {
    inner: Arc<Inner<E>>,
}

impl<E: Entity> Clone for InMemoryEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> Default for InMemoryEntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> InMemoryEntityStore<E> {
    /// Create an empty store that keeps ids as sent.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                records: RwLock::new(Vec::new()),
                allocator: None,
                latency: None,
                failures: Mutex::new(Failures::default()),
                commits: AtomicUsize::new(0),
            }),
        }
    }

    fn rebuild(self, change: impl FnOnce(&mut Inner<E>)) -> Self {
        let mut inner = Arc::try_unwrap(self.inner).ok().unwrap();
        change(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Assign ids on `add` with `allocator`, like a database sequence.
    ///
    /// Call before cloning the store.
    #[must_use]
    pub fn with_id_allocator(self, allocator: impl Fn() -> E::Id + Send + Sync + 'static) -> Self {
        self.rebuild(|inner| inner.allocator = Some(Box::new(allocator)))
    }

    /// Delay every `begin` by `latency`, widening the in-flight window.
    ///
    /// Call before cloning the store.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.rebuild(|inner| inner.latency = Some(latency))
    }

    /// Seed a record directly, bypassing units of work.
    pub fn insert(&self, entity: E) {
        self.inner.records.write().unwrap().push(entity);
    }

    /// Committed record with `id`.
    #[must_use]
    pub fn get(&self, id: &E::Id) -> Option<E> {
        self.inner
            .records
            .read()
            .unwrap()
            .iter()
            .find(|e| e.id() == *id)
            .cloned()
    }

    /// Every committed record, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<E> {
        self.inner.records.read().unwrap().clone()
    }

    /// Number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.records.read().unwrap().len()
    }

    /// Whether no record is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls to `begin` fail.
    pub fn fail_next_begins(&self, count: usize) {
        self.inner.failures.lock().unwrap().begin = count;
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.inner.failures.lock().unwrap().commit = count;
    }
}

impl<E: Entity> EntityStore<E> for InMemoryEntityStore<E> {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork<E>>, StoreError>> {
        Box::pin(async move {
            if let Some(latency) = self.inner.latency {
                tokio::time::sleep(latency).await;
            }

            {
                let mut failures = self.inner.failures.lock().unwrap();
                if failures.begin > 0 {
                    failures.begin -= 1;
                    return Err(StoreError::Backend("connection refused".to_string()));
                }
            }

            let work: Box<dyn UnitOfWork<E>> = Box::new(InMemoryUnitOfWork {
                inner: Arc::clone(&self.inner),
                staged: Vec::new(),
            });
            Ok(work)
        })
    }
}

#[derive(Debug, Clone)]
enum Change<E: Entity> {
    Add(E),
    Update(E),
    Delete(E::Id),
}

struct InMemoryUnitOfWork<E: Entity> {
    inner: Arc<Inner<E>>,
    staged: Vec<Change<E>>,
}

fn apply<E: Entity>(records: &mut Vec<E>, change: Change<E>) -> Result<(), StoreError> {
    match change {
        Change::Add(entity) => {
            let id = entity.id();
            if records.iter().any(|e| e.id() == id) {
                return Err(StoreError::Conflict(id.to_string()));
            }
            records.push(entity);
        }
        Change::Update(entity) => {
            let id = entity.id();
            let slot = records
                .iter_mut()
                .find(|e| e.id() == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            *slot = entity;
        }
        Change::Delete(id) => {
            let before = records.len();
            records.retain(|e| e.id() != id);
            if records.len() == before {
                return Err(StoreError::NotFound(id.to_string()));
            }
        }
    }
    Ok(())
}

impl<E: Entity> InMemoryUnitOfWork<E> {
    /// Committed records with this unit's staged changes applied.
    fn view(&self) -> Result<Vec<E>, StoreError> {
        let mut records = self.inner.records.read().unwrap().clone();
        for change in self.staged.iter().cloned() {
            apply(&mut records, change)?;
        }
        Ok(records)
    }

    fn stage(&mut self, change: Change<E>) -> Result<(), StoreError> {
        let mut records = self.view()?;
        apply(&mut records, change.clone())?;
        self.staged.push(change);
        Ok(())
    }
}

impl<E: Entity> UnitOfWork<E> for InMemoryUnitOfWork<E> {
    fn get_all(&mut self) -> BoxFuture<'_, Result<Vec<E>, StoreError>> {
        Box::pin(async move { self.view() })
    }

    fn get_by_id(&mut self, id: E::Id) -> BoxFuture<'_, Result<Option<E>, StoreError>> {
        Box::pin(async move { Ok(self.view()?.into_iter().find(|e| e.id() == id)) })
    }

    fn add(&mut self, mut entity: E) -> BoxFuture<'_, Result<E, StoreError>> {
        Box::pin(async move {
            if let Some(allocate) = &self.inner.allocator {
                entity.set_id(allocate());
            }
            self.stage(Change::Add(entity.clone()))?;
            Ok(entity)
        })
    }

    fn update(&mut self, entity: E) -> BoxFuture<'_, Result<E, StoreError>> {
        Box::pin(async move {
            self.stage(Change::Update(entity.clone()))?;
            Ok(entity)
        })
    }

    fn delete(&mut self, entity: E) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move { self.stage(Change::Delete(entity.id())) })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(async move {
            {
                let mut failures = self.inner.failures.lock().unwrap();
                if failures.commit > 0 {
                    failures.commit -= 1;
                    return Err(StoreError::Backend("deadlock detected".to_string()));
                }
            }

            let mut records = self.inner.records.write().unwrap();
            let mut next = records.clone();
            for change in self.staged {
                apply(&mut next, change)?;
            }
            *records = next;
            drop(records);

            self.inner.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
