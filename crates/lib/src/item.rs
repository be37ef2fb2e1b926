//! Build item types and identity.
//!
//! Build items are the typed, immutable units of information passed between
//! build steps. The concrete Rust type of an item acts as its topic: steps
//! declare production and consumption per type, and the chain compiler wires
//! producer/consumer edges by [`ItemId`].
//!
//! # Cardinality
//!
//! - [`SimpleBuildItem`]: at most one instance per execution. A second
//!   producer of the same simple item is a compile-time error.
//! - [`MultiBuildItem`]: zero or more instances. Every producer may
//!   contribute; consumers always observe the complete collection in
//!   canonical order.
//!
//! Items are never handed out by value: once published they live behind an
//! `Arc` and are treated as immutable.

use std::any::{Any, TypeId};
use std::sync::Arc;

/// Marker trait for all build items.
///
/// Implementors must be plain data: no interior mutability is expected, and
/// no mutation may happen after the item is produced.
pub trait BuildItem: Any + Send + Sync + std::fmt::Debug {}

/// A build item with cardinality at most one per execution.
pub trait SimpleBuildItem: BuildItem {}

/// A build item with cardinality zero or more per execution.
pub trait MultiBuildItem: BuildItem {}

/// A type-erased, published build item instance.
pub type AnyItem = Arc<dyn Any + Send + Sync>;

/// Identity of a build item type, used as the graph "topic".
///
/// Carries the `TypeId` for resolution and the type name for diagnostics.
/// Every error message that mentions an item goes through the [`Display`]
/// impl, so extension authors see `my_crate::CompiledRoutes` rather than an
/// opaque id.
///
/// [`Display`]: std::fmt::Display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId {
  type_id: TypeId,
  name: &'static str,
  multi: bool,
}

impl ItemId {
  /// The id of a simple build item type.
  pub fn simple<T: SimpleBuildItem>() -> Self {
    Self {
      type_id: TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
      multi: false,
    }
  }

  /// The id of a multi build item type.
  pub fn multi<T: MultiBuildItem>() -> Self {
    Self {
      type_id: TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
      multi: true,
    }
  }

  /// Whether this id names a multi item.
  pub fn is_multi(&self) -> bool {
    self.multi
  }

  /// The full Rust type name of the item.
  pub fn type_name(&self) -> &'static str {
    self.name
  }
}

impl std::fmt::Display for ItemId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.name)
  }
}

/// Erase a concrete item into its published form.
pub(crate) fn erase<T: BuildItem>(item: T) -> AnyItem {
  Arc::new(item)
}
