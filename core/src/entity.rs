//! Entities exchanged over the bridge and the local storage they are applied to.
//!
//! An [`Entity`] is any serializable record with an identifier. Instead of copying
//! fields by inspection, every entity spells out how an incoming update is
//! merged onto the stored record ([`Entity::merge_from`]).
//!
//! Storage is reached through an [`EntityStore`], which hands out one
//! [`UnitOfWork`] per processed message: acquire, operate, commit, drop.

use crate::transport::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;
use thiserror::Error;

/// An entity type that can be created, updated, deleted and fetched remotely.
///
/// # Example
///
/// ```
/// use entity_bridge_core::entity::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// struct Order {
///     id: u64,
///     amount: i64,
///     note: Option<String>,
/// }
///
/// impl Entity for Order {
///     type Id = u64;
///     const MODEL_TYPE: &'static str = "Order";
///
///     fn id(&self) -> u64 {
///         self.id
///     }
///
///     fn set_id(&mut self, id: u64) {
///         self.id = id;
///     }
///
///     fn merge_from(&mut self, incoming: Self) {
///         self.amount = incoming.amount;
///         self.note = incoming.note;
///     }
/// }
///
/// let mut stored = Order { id: 7, amount: 10, note: None };
/// stored.merge_from(Order { id: 99, amount: 20, note: Some("rush".into()) });
/// assert_eq!(stored, Order { id: 7, amount: 20, note: Some("rush".into()) });
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Identifier type. Parsed from its JSON form, or from text via `FromStr`.
    type Id: Serialize
        + DeserializeOwned
        + FromStr
        + Display
        + Debug
        + Clone
        + Eq
        + Hash
        + Send
        + Sync
        + 'static;

    /// Wire name carried in `modelType`, e.g. `"Order"`.
    const MODEL_TYPE: &'static str;

    /// This record's identifier.
    fn id(&self) -> Self::Id;

    /// Replace this record's identifier (used when storage assigns one).
    fn set_id(&mut self, id: Self::Id);

    /// Copy every field except the identifier from `incoming` onto `self`.
    fn merge_from(&mut self, incoming: Self);
}

/// Errors reported by the local storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No record with the given id.
    #[error("Entity with ID {0} not found.")]
    NotFound(String),

    /// A record with the given id already exists.
    #[error("Entity with ID {0} already exists.")]
    Conflict(String),

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Factory for per-message units of work over one entity type.
pub trait EntityStore<E: Entity>: Send + Sync {
    /// Begin a unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if no connection can be acquired.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork<E>>, StoreError>>;
}

/// A scoped session over local storage.
///
/// Changes made through `add`, `update` and `delete` become visible once
/// [`UnitOfWork::commit`] succeeds; dropping an uncommitted unit discards them.
pub trait UnitOfWork<E: Entity>: Send {
    /// Every stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn get_all(&mut self) -> BoxFuture<'_, Result<Vec<E>, StoreError>>;

    /// The record with `id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    fn get_by_id(&mut self, id: E::Id) -> BoxFuture<'_, Result<Option<E>, StoreError>>;

    /// Stage a new record; returns it as stored (with any assigned id).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the id is taken.
    fn add(&mut self, entity: E) -> BoxFuture<'_, Result<E, StoreError>>;

    /// Stage a replacement of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is nothing to replace.
    fn update(&mut self, entity: E) -> BoxFuture<'_, Result<E, StoreError>>;

    /// Stage removal of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is nothing to remove.
    fn delete(&mut self, entity: E) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Persist staged changes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the changes could not be saved.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Read an identifier from its JSON form, falling back to `FromStr` for
/// identifiers sent as text (e.g. `"42"` for a numeric id).
///
/// ```
/// use entity_bridge_core::entity::parse_id;
/// # use entity_bridge_core::entity::Entity;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Clone, Serialize, Deserialize)]
/// # struct Order { id: u64 }
/// # impl Entity for Order {
/// #     type Id = u64;
/// #     const MODEL_TYPE: &'static str = "Order";
/// #     fn id(&self) -> u64 { self.id }
/// #     fn set_id(&mut self, id: u64) { self.id = id; }
/// #     fn merge_from(&mut self, _incoming: Self) {}
/// # }
/// use serde_json::json;
///
/// assert_eq!(parse_id::<Order>(&json!(42)), Some(42));
/// assert_eq!(parse_id::<Order>(&json!("42")), Some(42));
/// assert_eq!(parse_id::<Order>(&json!(null)), None);
/// ```
#[must_use]
pub fn parse_id<E: Entity>(value: &serde_json::Value) -> Option<E::Id> {
    if let Ok(id) = serde_json::from_value::<E::Id>(value.clone()) {
        return Some(id);
    }
    value.as_str().and_then(|raw| raw.trim().parse().ok())
}
