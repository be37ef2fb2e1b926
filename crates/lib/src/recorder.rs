//! Build-time value capture and startup replay.
//!
//! Values computed during build-step execution that must exist again in the
//! running application are not kept alive across the boundary; they are
//! recorded as (factory, arguments) invocations, serialized into the build
//! artifact, and reconstructed at startup by replaying each invocation
//! against a registry of factories.
//!
//! The contract: anything recorded must be deterministically
//! reconstructable from its serialized arguments alone. Replay happens in
//! capture order, grouped by phase (static-init recordings replay before
//! runtime-init ones).
//!
//! A [`Recording`] is an ordinary multi build item: steps produce
//! recordings, and a terminal consumer embeds them in the output artifact.

use std::any::Any;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::item::{BuildItem, MultiBuildItem};
use crate::phase::Phase;

/// One captured constructor call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedInvocation {
  /// Registered factory name.
  pub factory: String,
  /// Serialized arguments, exactly as captured.
  pub args: serde_json::Value,
}

/// A sealed, serializable sequence of invocations to replay at one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
  phase: Phase,
  invocations: Vec<RecordedInvocation>,
}

impl BuildItem for Recording {}
impl MultiBuildItem for Recording {}

impl Recording {
  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn invocations(&self) -> &[RecordedInvocation] {
    &self.invocations
  }

  pub fn is_empty(&self) -> bool {
    self.invocations.is_empty()
  }
}

/// Errors while capturing values.
#[derive(Debug, Error)]
pub enum RecordError {
  #[error("failed to serialize arguments for factory {factory}: {source}")]
  Serialize {
    factory: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Errors while replaying a recording.
#[derive(Debug, Error)]
pub enum ReplayError {
  #[error("no factory registered under name {factory}")]
  UnknownFactory { factory: String },

  #[error("failed to deserialize arguments for factory {factory}: {source}")]
  Deserialize {
    factory: String,
    #[source]
    source: serde_json::Error,
  },
}

/// Captures invocations during a build step.
pub struct Recorder {
  phase: Phase,
  invocations: Vec<RecordedInvocation>,
}

impl Recorder {
  /// A recorder whose recording replays at the given phase.
  pub fn new(phase: Phase) -> Self {
    Self {
      phase,
      invocations: Vec::new(),
    }
  }

  /// Capture one invocation of a named factory.
  pub fn record<A: Serialize>(&mut self, factory: impl Into<String>, args: &A) -> Result<(), RecordError> {
    let factory = factory.into();
    let args = serde_json::to_value(args).map_err(|source| RecordError::Serialize {
      factory: factory.clone(),
      source,
    })?;
    debug!(factory = %factory, "recorded invocation");
    self.invocations.push(RecordedInvocation { factory, args });
    Ok(())
  }

  /// Seal the capture into an immutable recording.
  pub fn finish(self) -> Recording {
    Recording {
      phase: self.phase,
      invocations: self.invocations,
    }
  }
}

type Factory = Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Any + Send>, ReplayError> + Send + Sync>;

/// Maps factory names to constructors for replay.
#[derive(Default)]
pub struct ReplayRegistry {
  factories: HashMap<String, Factory>,
}

impl ReplayRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a factory under a name.
  ///
  /// The factory receives the deserialized arguments and must construct the
  /// value deterministically: same arguments, same value.
  pub fn register<A, T>(&mut self, name: impl Into<String>, factory: impl Fn(A) -> T + Send + Sync + 'static)
  where
    A: for<'de> Deserialize<'de>,
    T: Any + Send,
  {
    let name = name.into();
    let wrapper_name = name.clone();
    self.factories.insert(
      name,
      Box::new(move |args| {
        let args: A = serde_json::from_value(args.clone()).map_err(|source| ReplayError::Deserialize {
          factory: wrapper_name.clone(),
          source,
        })?;
        Ok(Box::new(factory(args)))
      }),
    );
  }

  /// Replay one recording, reconstructing values in capture order.
  pub fn replay(&self, recording: &Recording) -> Result<Vec<Box<dyn Any + Send>>, ReplayError> {
    recording
      .invocations
      .iter()
      .map(|invocation| {
        let factory = self
          .factories
          .get(&invocation.factory)
          .ok_or_else(|| ReplayError::UnknownFactory {
            factory: invocation.factory.clone(),
          })?;
        factory(&invocation.args)
      })
      .collect()
  }

  /// Replay a set of recordings grouped by phase: all static-init
  /// recordings first, then runtime-init, keeping relative order within
  /// each phase.
  pub fn replay_all<'a>(
    &self,
    recordings: impl IntoIterator<Item = &'a Recording>,
  ) -> Result<Vec<Box<dyn Any + Send>>, ReplayError> {
    let mut by_phase: Vec<&Recording> = recordings.into_iter().collect();
    by_phase.sort_by_key(|recording| recording.phase);
    let mut values = Vec::new();
    for recording in by_phase {
      values.extend(self.replay(recording)?);
    }
    Ok(values)
  }
}
