//! Build step contracts.
//!
//! A build step is a registered callable plus its declared contract: which
//! item types it produces, which it consumes, its execution phase, and
//! whether it must run even when nothing downstream consumes its output.
//!
//! The contract is declared up front on a [`StepBuilder`] and is frozen when
//! the step is registered with a chain builder. The running step only ever
//! touches items through its [`StepContext`], which enforces the declared
//! contract at every access.
//!
//! [`StepContext`]: crate::execute::StepContext

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::execute::StepContext;
use crate::item::{ItemId, MultiBuildItem, SimpleBuildItem};
use crate::phase::Phase;

/// Unique identity of a build step, used in every diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(Arc<str>);

impl StepId {
  pub fn new(name: impl AsRef<str>) -> Self {
    Self(Arc::from(name.as_ref()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for StepId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A unit of build work.
///
/// Steps are invoked exactly once per chain execution (or never, when pruned
/// from the compiled chain). The body may block on I/O; the engine runs it
/// on the blocking pool.
pub trait BuildStep: Send + Sync {
  fn execute(&self, cx: &mut StepContext) -> Result<(), StepError>;
}

impl<F> BuildStep for F
where
  F: Fn(&mut StepContext) -> Result<(), StepError> + Send + Sync,
{
  fn execute(&self, cx: &mut StepContext) -> Result<(), StepError> {
    self(cx)
  }
}

/// Errors raised by a running step, or by the contract checks around it.
#[derive(Debug, Error)]
pub enum StepError {
  /// The step consumed an item type it never declared.
  #[error("step {step} consumed undeclared item {item}")]
  UndeclaredConsume { step: StepId, item: ItemId },

  /// The step produced an item type it never declared.
  #[error("step {step} produced undeclared item {item}")]
  UndeclaredProduce { step: StepId, item: ItemId },

  /// The step produced the same simple item twice in one invocation.
  #[error("step {step} produced simple item {item} more than once")]
  DuplicateProduce { step: StepId, item: ItemId },

  /// A required item was never published by its producer.
  #[error("step {step} requires item {item}, but its producer completed without producing it")]
  MissingItem { step: StepId, item: ItemId },

  /// The step body failed.
  #[error("step failed: {0}")]
  Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StepError {
  /// Wrap an arbitrary step-domain failure.
  pub fn failed(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
    StepError::Failed(err.into())
  }

  /// A step-domain failure from a plain message.
  pub fn message(msg: impl Into<String>) -> Self {
    StepError::Failed(msg.into().into())
  }
}

/// Errors raised when a malformed step declaration is registered.
///
/// These are detected at registration time, before compilation.
#[derive(Debug, Error)]
pub enum RegistrationError {
  #[error("step name must not be empty")]
  EmptyStepName,

  #[error("step {step} is already registered")]
  DuplicateStepName { step: StepId },

  #[error("step {step} declares item {item} more than once")]
  DuplicateDeclaration { step: StepId, item: ItemId },
}

/// How a declared consumption is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
  /// The item must have a producer (or be initial); compilation fails
  /// otherwise.
  Required,
  /// The step runs with or without a producer and observes absence.
  Optional,
  /// Multi consumption; zero producers yields the empty collection.
  Multi,
}

/// A single produces declaration.
#[derive(Debug, Clone, Copy)]
pub struct Produce {
  pub(crate) id: ItemId,
  /// Weak production satisfies consumers but does not by itself pull the
  /// producing step into the chain.
  pub(crate) weak: bool,
  /// An overridable producer of a simple item yields to a non-overridable
  /// one instead of conflicting with it.
  pub(crate) overridable: bool,
}

/// A single consumes declaration.
#[derive(Debug, Clone, Copy)]
pub struct Consume {
  pub(crate) id: ItemId,
  pub(crate) mode: ConsumeMode,
}

/// Declares a build step's contract before registration.
///
/// The builder is fluent; validation happens when the step is handed to
/// [`ChainBuilder::add_step`], which rejects empty names and duplicate item
/// declarations with a [`RegistrationError`].
///
/// [`ChainBuilder::add_step`]: crate::chain::ChainBuilder::add_step
pub struct StepBuilder {
  pub(crate) id: StepId,
  pub(crate) step: Arc<dyn BuildStep>,
  pub(crate) produces: Vec<Produce>,
  pub(crate) consumes: Vec<Consume>,
  pub(crate) phase: Phase,
  pub(crate) always_run: bool,
}

impl StepBuilder {
  pub fn new(name: impl AsRef<str>, step: impl BuildStep + 'static) -> Self {
    Self {
      id: StepId::new(name),
      step: Arc::new(step),
      produces: Vec::new(),
      consumes: Vec::new(),
      phase: Phase::default(),
      always_run: false,
    }
  }

  /// Declare production of a simple item.
  #[must_use]
  pub fn produces<T: SimpleBuildItem>(mut self) -> Self {
    self.produces.push(Produce {
      id: ItemId::simple::<T>(),
      weak: false,
      overridable: false,
    });
    self
  }

  /// Declare weak production of a simple item.
  #[must_use]
  pub fn produces_weak<T: SimpleBuildItem>(mut self) -> Self {
    self.produces.push(Produce {
      id: ItemId::simple::<T>(),
      weak: true,
      overridable: false,
    });
    self
  }

  /// Declare overridable production of a simple item.
  #[must_use]
  pub fn produces_overridable<T: SimpleBuildItem>(mut self) -> Self {
    self.produces.push(Produce {
      id: ItemId::simple::<T>(),
      weak: false,
      overridable: true,
    });
    self
  }

  /// Declare production of instances of a multi item.
  #[must_use]
  pub fn produces_multi<T: MultiBuildItem>(mut self) -> Self {
    self.produces.push(Produce {
      id: ItemId::multi::<T>(),
      weak: false,
      overridable: false,
    });
    self
  }

  /// Declare weak production of instances of a multi item.
  #[must_use]
  pub fn produces_multi_weak<T: MultiBuildItem>(mut self) -> Self {
    self.produces.push(Produce {
      id: ItemId::multi::<T>(),
      weak: true,
      overridable: false,
    });
    self
  }

  /// Declare required consumption of a simple item.
  #[must_use]
  pub fn consumes<T: SimpleBuildItem>(mut self) -> Self {
    self.consumes.push(Consume {
      id: ItemId::simple::<T>(),
      mode: ConsumeMode::Required,
    });
    self
  }

  /// Declare optional consumption of a simple item.
  #[must_use]
  pub fn consumes_optional<T: SimpleBuildItem>(mut self) -> Self {
    self.consumes.push(Consume {
      id: ItemId::simple::<T>(),
      mode: ConsumeMode::Optional,
    });
    self
  }

  /// Declare consumption of the full collection of a multi item.
  #[must_use]
  pub fn consumes_multi<T: MultiBuildItem>(mut self) -> Self {
    self.consumes.push(Consume {
      id: ItemId::multi::<T>(),
      mode: ConsumeMode::Multi,
    });
    self
  }

  /// Tag the step with an execution-time phase.
  #[must_use]
  pub fn phase(mut self, phase: Phase) -> Self {
    self.phase = phase;
    self
  }

  /// Exempt the step from pruning.
  ///
  /// Side-effect-only steps (validation, diagnostics) must opt in
  /// explicitly; the compiler never infers intent from graph shape.
  #[must_use]
  pub fn always_run(mut self) -> Self {
    self.always_run = true;
    self
  }

  /// Check the declaration set for locally-detectable mistakes.
  pub(crate) fn validate(&self) -> Result<(), RegistrationError> {
    if self.id.as_str().is_empty() {
      return Err(RegistrationError::EmptyStepName);
    }
    let mut seen = HashSet::new();
    for produce in &self.produces {
      if !seen.insert(produce.id) {
        return Err(RegistrationError::DuplicateDeclaration {
          step: self.id.clone(),
          item: produce.id,
        });
      }
    }
    let mut seen = HashSet::new();
    for consume in &self.consumes {
      if !seen.insert(consume.id) {
        return Err(RegistrationError::DuplicateDeclaration {
          step: self.id.clone(),
          item: consume.id,
        });
      }
    }
    Ok(())
  }
}
