//! Per-step execution context and the shared item store.
//!
//! Each step invocation owns a [`StepContext`] prepared by the engine: the
//! resolved inputs (snapshotted from items whose producers have already
//! completed) and an empty production buffer. Productions are published to
//! the shared [`ItemStore`] only after the step returns, so no reader ever
//! observes a torn write, and no locking is needed inside a step body.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::item::{AnyItem, ItemId, MultiBuildItem, SimpleBuildItem, erase};
use crate::step::{StepError, StepId};

/// A resolved input handed to a step.
pub(super) enum InputValue {
  /// A simple item whose producer published it.
  Simple(AnyItem),
  /// A declared simple input whose producer completed without producing,
  /// or an optional input with no producer in the chain.
  Absent,
  /// The complete, canonically ordered collection of a multi item.
  Multi(Vec<AnyItem>),
}

/// One buffered production, published after the step returns.
pub(super) struct ProducedItem {
  pub id: ItemId,
  pub value: AnyItem,
  pub overridable: bool,
}

/// The view a running step has of the build.
///
/// All access is checked against the step's declared contract; consuming or
/// producing an undeclared item type is a [`StepError`], never a silent
/// pass-through.
pub struct StepContext {
  step: StepId,
  inputs: HashMap<ItemId, InputValue>,
  /// Declared produces, with the overridable flag for simple items.
  produce_decls: HashMap<ItemId, bool>,
  produced: Vec<ProducedItem>,
  produced_simple: HashSet<ItemId>,
}

impl StepContext {
  pub(super) fn new(step: StepId, inputs: HashMap<ItemId, InputValue>, produce_decls: HashMap<ItemId, bool>) -> Self {
    Self {
      step,
      inputs,
      produce_decls,
      produced: Vec::new(),
      produced_simple: HashSet::new(),
    }
  }

  /// The identity of the running step.
  pub fn step_id(&self) -> &StepId {
    &self.step
  }

  /// Consume a declared simple item, failing if it was never produced.
  pub fn consume<T: SimpleBuildItem>(&self) -> Result<Arc<T>, StepError> {
    let id = ItemId::simple::<T>();
    match self.inputs.get(&id) {
      // Inputs are filed under their own type id, so the downcast holds.
      Some(InputValue::Simple(value)) => Ok(value.clone().downcast::<T>().unwrap()),
      Some(InputValue::Absent) => Err(StepError::MissingItem {
        step: self.step.clone(),
        item: id,
      }),
      _ => Err(StepError::UndeclaredConsume {
        step: self.step.clone(),
        item: id,
      }),
    }
  }

  /// Consume a declared simple item that may be absent.
  pub fn consume_optional<T: SimpleBuildItem>(&self) -> Result<Option<Arc<T>>, StepError> {
    let id = ItemId::simple::<T>();
    match self.inputs.get(&id) {
      Some(InputValue::Simple(value)) => Ok(Some(value.clone().downcast::<T>().unwrap())),
      Some(InputValue::Absent) => Ok(None),
      _ => Err(StepError::UndeclaredConsume {
        step: self.step.clone(),
        item: id,
      }),
    }
  }

  /// Consume the full collection of a declared multi item.
  ///
  /// The collection is complete (every producer has finished) and in
  /// canonical order; zero producers yields an empty vector.
  pub fn consume_multi<T: MultiBuildItem>(&self) -> Result<Vec<Arc<T>>, StepError> {
    let id = ItemId::multi::<T>();
    match self.inputs.get(&id) {
      Some(InputValue::Multi(values)) => Ok(
        values
          .iter()
          .map(|value| value.clone().downcast::<T>().unwrap())
          .collect(),
      ),
      _ => Err(StepError::UndeclaredConsume {
        step: self.step.clone(),
        item: id,
      }),
    }
  }

  /// Produce a declared simple item.
  pub fn produce<T: SimpleBuildItem>(&mut self, item: T) -> Result<(), StepError> {
    let id = ItemId::simple::<T>();
    let Some(overridable) = self.produce_decls.get(&id).copied() else {
      return Err(StepError::UndeclaredProduce {
        step: self.step.clone(),
        item: id,
      });
    };
    if !self.produced_simple.insert(id) {
      return Err(StepError::DuplicateProduce {
        step: self.step.clone(),
        item: id,
      });
    }
    self.produced.push(ProducedItem {
      id,
      value: erase(item),
      overridable,
    });
    Ok(())
  }

  /// Contribute one instance of a declared multi item.
  ///
  /// May be called any number of times; instances keep their production
  /// order within this step.
  pub fn produce_multi<T: MultiBuildItem>(&mut self, item: T) -> Result<(), StepError> {
    let id = ItemId::multi::<T>();
    if !self.produce_decls.contains_key(&id) {
      return Err(StepError::UndeclaredProduce {
        step: self.step.clone(),
        item: id,
      });
    }
    self.produced.push(ProducedItem {
      id,
      value: erase(item),
      overridable: false,
    });
    Ok(())
  }

  pub(super) fn into_produced(self) -> Vec<ProducedItem> {
    self.produced
  }
}

/// A published simple item with its override standing.
struct SimpleSlot {
  value: AnyItem,
  overridable: bool,
}

/// One multi contribution with its canonical sort key.
struct MultiEntry {
  /// (producer registration rank, intra-step sequence). Initial items rank
  /// before every step contribution.
  order: (usize, usize),
  value: AnyItem,
}

/// The only shared mutable structure of an execution.
///
/// Writes happen exactly once per (step, item) pair, on the scheduler loop,
/// after the producing step returned.
#[derive(Default)]
pub(super) struct ItemStore {
  simple: HashMap<ItemId, SimpleSlot>,
  multi: HashMap<ItemId, Vec<MultiEntry>>,
}

impl ItemStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Publish a simple item.
  ///
  /// A non-overridable value replaces an overridable one; an overridable
  /// value never displaces a non-overridable one. The compiler guarantees
  /// at most one producer of each standing, so no other collision exists.
  pub fn publish_simple(&mut self, id: ItemId, value: AnyItem, overridable: bool) {
    match self.simple.get(&id) {
      Some(existing) if !existing.overridable && overridable => {}
      _ => {
        self.simple.insert(id, SimpleSlot { value, overridable });
      }
    }
  }

  /// Publish one multi contribution under its canonical sort key.
  pub fn publish_multi(&mut self, id: ItemId, order: (usize, usize), value: AnyItem) {
    self.multi.entry(id).or_default().push(MultiEntry { order, value });
  }

  pub fn get_simple(&self, id: ItemId) -> Option<AnyItem> {
    self.simple.get(&id).map(|slot| slot.value.clone())
  }

  /// The complete collection of a multi item, in canonical order.
  pub fn collect_multi(&self, id: ItemId) -> Vec<AnyItem> {
    let mut entries: Vec<(&(usize, usize), &AnyItem)> = self
      .multi
      .get(&id)
      .map(Vec::as_slice)
      .unwrap_or_default()
      .iter()
      .map(|entry| (&entry.order, &entry.value))
      .collect();
    entries.sort_by_key(|(order, _)| **order);
    entries.into_iter().map(|(_, value)| value.clone()).collect()
  }
}
