use revlm::config::{BlockKind, Config};
use revlm::context::{Context, Mode, ParamStore};
use revlm::distributed::LocalCollective;
use revlm::model::{self, TokenBatch};
use revlm::train::Replica;

/// Two layers over a 4-token vocabulary.
fn toy_config(seed: u64) -> Config {
    let mut config = Config::default();
    config.data.vocab_size = 4;
    config.dims.batch = 2;
    config.dims.sequence = 8;
    config.dims.heads = 2;
    config.dims.features_per_head = 4;
    config.dims.intermediate = 8;
    config.model.depth = 2;
    config.model.seed = seed;
    config.model.blocks = vec![BlockKind::Attention, BlockKind::FeedForward];
    config
}

fn toy_batch() -> TokenBatch {
    let windows: Vec<usize> = (0..2 * 9).map(|i| (i * 3 + i / 5) % 4).collect();
    TokenBatch::from_windows(&windows, 2, 8).unwrap()
}

fn init_store(config: Config) -> ParamStore {
    let mut ctx = Context::new(config, Mode::Init);
    model::init_params(&mut ctx, &toy_batch()).unwrap();
    let store = ctx.store().clone();
    store
}

#[test]
fn test_end_to_end_step() {
    let mut init = Context::new(toy_config(0), Mode::Init);
    model::init_params(&mut init, &toy_batch()).unwrap();
    let names = init.store().model_names();
    assert!(!names.is_empty());

    let mut ctx = Context::with_store(init.config_rc(), init.store_rc(), Mode::Compute);
    let out = model::compute(&mut ctx, &toy_batch()).unwrap();
    assert!(out.loss.is_finite());
    assert!(out.top_loss.is_finite());
    assert!((0.0..=1.0).contains(&out.accuracy));
    assert_eq!(out.grads.keys().cloned().collect::<Vec<_>>(), names);
    for (name, grad) in &out.grads {
        assert_eq!(Some(grad.shape()), ctx.store().get(name).map(|t| t.shape()), "{name}");
        assert!(grad.all_finite(), "{name}");
    }
}

#[test]
fn test_one_training_step_through_the_optimizer() {
    let mut replica = Replica::new(toy_config(0), LocalCollective, &toy_batch()).unwrap();
    let first = replica.train_step(&toy_batch()).unwrap();
    assert!(first.loss.is_finite());
    assert_eq!(first.step, 1);

    let store = replica.context().store();
    for name in store.model_names() {
        assert!(store.get(&name).unwrap().all_finite(), "{name}");
    }
    assert!(store.names().any(|n| n.starts_with("/optimizer:0/")));
}

#[test]
fn test_initialization_is_deterministic() {
    let a = init_store(toy_config(7));
    let b = init_store(toy_config(7));
    let names: Vec<_> = a.names().cloned().collect();
    assert_eq!(names, b.names().cloned().collect::<Vec<_>>());
    for name in &names {
        assert_eq!(a.get(name), b.get(name), "{name}");
    }

    let c = init_store(toy_config(8));
    assert!(names.iter().any(|name| a.get(name) != c.get(name)));
}

#[test]
fn test_momentum_network_trains() {
    let mut config = toy_config(0);
    config.model.momentumnet = true;
    config.model.blocks = vec![BlockKind::FeedForward, BlockKind::DepthwiseConv];
    let mut replica = Replica::new(config, LocalCollective, &toy_batch()).unwrap();
    assert!(replica.train_step(&toy_batch()).unwrap().loss.is_finite());
}
