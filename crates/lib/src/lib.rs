//! stepchain-lib: a build-step orchestration engine.
//!
//! Build steps declare the typed items they produce and consume; the chain
//! builder compiles those declarations into a deterministic DAG, and the
//! execution engine runs the compiled chain with dependency-driven
//! parallelism:
//! - [`item`]: typed, immutable build items (simple and multi cardinality)
//! - [`step`]: step contracts, declarations, and registration errors
//! - [`chain`]: registration, compilation, pruning, cycle detection
//! - [`execute`]: the execution engine, context, and build result
//! - [`phase`]: build-time / static-init / runtime-init execution phases
//! - [`lifecycle`]: the running application's lifecycle state
//! - [`recorder`]: build-time value capture and startup replay

pub mod chain;
pub mod execute;
pub mod item;
pub mod lifecycle;
pub mod phase;
pub mod recorder;
pub mod step;
