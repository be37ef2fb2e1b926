//! Recording capture inside build steps, replay at simulated startup.

use serde::{Deserialize, Serialize};

use stepchain_lib::chain::ChainBuilder;
use stepchain_lib::execute::{ExecuteConfig, StepContext};
use stepchain_lib::lifecycle::{Lifecycle, LifecycleState};
use stepchain_lib::phase::Phase;
use stepchain_lib::recorder::{Recorder, Recording, ReplayRegistry};
use stepchain_lib::step::StepBuilder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DataSource {
  url: String,
  pool_size: u32,
}

#[tokio::test]
async fn recordings_flow_through_the_chain_and_replay_in_phase_order() {
  let mut builder = ChainBuilder::new();
  builder.add_final_multi::<Recording>();

  builder
    .add_step(
      StepBuilder::new("record-datasource", |cx: &mut StepContext| {
        let mut recorder = Recorder::new(Phase::RuntimeInit);
        recorder
          .record(
            "datasource",
            &DataSource {
              url: "db://prod".into(),
              pool_size: 16,
            },
          )
          .map_err(stepchain_lib::step::StepError::failed)?;
        cx.produce_multi(recorder.finish())
      })
      .produces_multi::<Recording>(),
    )
    .unwrap();

  builder
    .add_step(
      StepBuilder::new("record-banner", |cx: &mut StepContext| {
        let mut recorder = Recorder::new(Phase::StaticInit);
        recorder
          .record("banner", &"booting".to_string())
          .map_err(stepchain_lib::step::StepError::failed)?;
        cx.produce_multi(recorder.finish())
      })
      .produces_multi::<Recording>(),
    )
    .unwrap();

  let chain = builder.build().unwrap();
  let result = chain
    .execution()
    .run(&ExecuteConfig { parallelism: 2 })
    .await
    .unwrap();

  let recordings = result.multi::<Recording>();
  assert_eq!(recordings.len(), 2);

  // The artifact boundary: serialize, then reconstruct from bytes alone.
  let serialized = serde_json::to_string(&recordings.iter().map(|r| (**r).clone()).collect::<Vec<_>>()).unwrap();
  let restored: Vec<Recording> = serde_json::from_str(&serialized).unwrap();

  // Simulated application startup.
  let lifecycle = Lifecycle::new();
  lifecycle.advance(LifecycleState::Starting).unwrap();

  let mut registry = ReplayRegistry::new();
  registry.register("banner", |text: String| text);
  registry.register("datasource", |ds: DataSource| ds);

  let values = registry.replay_all(restored.iter()).unwrap();
  assert_eq!(values.len(), 2);
  // Static-init replays before runtime-init, whatever the capture order.
  assert_eq!(values[0].downcast_ref::<String>().unwrap(), "booting");
  let ds = values[1].downcast_ref::<DataSource>().unwrap();
  assert_eq!(ds.pool_size, 16);

  lifecycle.advance(LifecycleState::Started).unwrap();

  let observer = lifecycle.clone();
  let seen = tokio::spawn(async move { observer.wait_for(LifecycleState::Started).await })
    .await
    .unwrap();
  assert_eq!(seen, LifecycleState::Started);
}

#[tokio::test]
async fn replay_is_deterministic_across_executions() {
  fn build_chain() -> stepchain_lib::chain::BuildChain {
    let mut builder = ChainBuilder::new();
    builder.add_final_multi::<Recording>();
    builder
      .add_step(
        StepBuilder::new("record", |cx: &mut StepContext| {
          let mut recorder = Recorder::new(Phase::StaticInit);
          for i in 0..3u32 {
            recorder
              .record("value", &i)
              .map_err(stepchain_lib::step::StepError::failed)?;
          }
          cx.produce_multi(recorder.finish())
        })
        .produces_multi::<Recording>(),
      )
      .unwrap();
    builder.build().unwrap()
  }

  let chain = build_chain();
  let config = ExecuteConfig { parallelism: 2 };
  let first = chain.execution().run(&config).await.unwrap();
  let second = chain.execution().run(&config).await.unwrap();

  let as_values = |result: &stepchain_lib::execute::BuildResult| {
    let mut registry = ReplayRegistry::new();
    registry.register("value", |n: u32| n);
    let recordings = result.multi::<Recording>();
    registry
      .replay_all(recordings.iter().map(|r| &**r))
      .unwrap()
      .iter()
      .map(|v| *v.downcast_ref::<u32>().unwrap())
      .collect::<Vec<u32>>()
  };

  assert_eq!(as_values(&first), as_values(&second));
  assert_eq!(as_values(&first), vec![0, 1, 2]);
}
