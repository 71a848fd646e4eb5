//! Order storage for the demo service.
//!
//! Orders live in a map behind a mutex. A unit of work overlays its staged
//! writes on the committed orders and applies them together on commit. Ids
//! come from a sequence, so a rolled-back create leaves a gap.

use crate::Order;
use entity_bridge_core::{BoxFuture, EntityStore, StoreError, UnitOfWork};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Orders {
    committed: BTreeMap<u64, Order>,
    last_id: u64,
}

/// Shared order table. Cloning shares the orders.
#[derive(Debug, Clone, Default)]
pub struct OrderStore {
    orders: Arc<Mutex<Orders>>,
}

impl OrderStore {
    /// Number of committed orders.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.orders).committed.len()
    }
}

fn lock(orders: &Mutex<Orders>) -> MutexGuard<'_, Orders> {
    orders.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EntityStore<Order> for OrderStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork<Order>>, StoreError>> {
        Box::pin(async move {
            let work: Box<dyn UnitOfWork<Order>> = Box::new(OrderWork {
                orders: Arc::clone(&self.orders),
                staged: BTreeMap::new(),
            });
            Ok(work)
        })
    }
}

/// Staged writes keyed by id; `None` marks a removal.
struct OrderWork {
    orders: Arc<Mutex<Orders>>,
    staged: BTreeMap<u64, Option<Order>>,
}

impl OrderWork {
    fn find(&self, id: u64) -> Option<Order> {
        match self.staged.get(&id) {
            Some(staged) => staged.clone(),
            None => lock(&self.orders).committed.get(&id).cloned(),
        }
    }

    fn existing(&self, id: u64) -> Result<Order, StoreError> {
        self.find(id).ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

impl UnitOfWork<Order> for OrderWork {
    fn get_all(&mut self) -> BoxFuture<'_, Result<Vec<Order>, StoreError>> {
        Box::pin(async move {
            let mut view = lock(&self.orders).committed.clone();
            for (id, staged) in &self.staged {
                match staged {
                    Some(order) => view.insert(*id, order.clone()),
                    None => view.remove(id),
                };
            }
            Ok(view.into_values().collect())
        })
    }

    fn get_by_id(&mut self, id: u64) -> BoxFuture<'_, Result<Option<Order>, StoreError>> {
        Box::pin(async move { Ok(self.find(id)) })
    }

    fn add(&mut self, mut order: Order) -> BoxFuture<'_, Result<Order, StoreError>> {
        Box::pin(async move {
            let id = {
                let mut orders = lock(&self.orders);
                orders.last_id += 1;
                orders.last_id
            };
            order.id = id;
            self.staged.insert(id, Some(order.clone()));
            Ok(order)
        })
    }

    fn update(&mut self, order: Order) -> BoxFuture<'_, Result<Order, StoreError>> {
        Box::pin(async move {
            self.existing(order.id)?;
            self.staged.insert(order.id, Some(order.clone()));
            Ok(order)
        })
    }

    fn delete(&mut self, order: Order) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.existing(order.id)?;
            self.staged.insert(order.id, None);
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        let Self { orders, staged } = *self;
        Box::pin(async move {
            let mut orders = lock(&orders);
            for (id, staged) in staged {
                match staged {
                    Some(order) => orders.committed.insert(id, order),
                    None => orders.committed.remove(&id),
                };
            }
            Ok(())
        })
    }
}
