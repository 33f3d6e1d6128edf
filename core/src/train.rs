//! Data-parallel training loop.
//!
//! Each replica owns a full copy of the parameters and optimizer state in its
//! own [`Context`]. A step computes local gradients, averages them across
//! replicas with [`Collective::all_reduce_mean`], and applies the same
//! optimizer update everywhere, so replicas never drift apart.
//!
//! ```text
//!            ┌─► replica 0 ─┐
//! batches ───┼─► replica 1 ─┼─ all_reduce_mean(grads) ─► optimizer ─► checkpoint (rank 0)
//!            └─► replica n ─┘
//! ```

use crate::checkpoint::{Checkpointer, LocalStore, ObjectStore, TrainMetrics};
use crate::config::Config;
use crate::context::{Context, Mode};
use crate::data::{TokenBatches, TokenSource};
use crate::distributed::{Collective, CpuMesh, LocalCollective};
use crate::error::{Error, Result};
use crate::model::{self, TokenBatch};
use crate::optim::Optimizer;
use crate::tensor::Tensor;
use crossbeam::channel::{Receiver, bounded};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Progress after the most recent step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainState {
    /// Optimizer steps taken so far.
    pub step: usize,
    pub top_loss: f32,
    pub loss: f32,
    pub accuracy: f32,
}

impl TrainState {
    fn metrics(&self) -> TrainMetrics {
        TrainMetrics {
            loss: self.loss,
            accuracy: self.accuracy,
            current_step: self.step,
        }
    }
}

/// One data-parallel copy of the model.
pub struct Replica<C: Collective> {
    ctx: Context,
    optimizer: Optimizer,
    collective: C,
    state: TrainState,
}

impl<C: Collective> std::fmt::Debug for Replica<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("rank", &self.collective.rank())
            .field("state", &self.state)
            .finish()
    }
}

impl<C: Collective> Replica<C> {
    /// Materializes model parameters from `sample` and then the optimizer state.
    pub fn new(config: Config, collective: C, sample: &TokenBatch) -> Result<Self> {
        let optimizer = Optimizer::new(config.optimizer.clone());
        let mut init = Context::new(config, Mode::Init);
        model::init_params(&mut init, sample)?;
        let parameters = init.store().len();
        optimizer.init_state(&init)?;
        debug!(
            rank = collective.rank(),
            parameters,
            entries = init.store().len(),
            "replica initialized"
        );
        let ctx = Context::with_store(init.config_rc(), init.store_rc(), Mode::Compute);
        Ok(Self {
            ctx,
            optimizer,
            collective,
            state: TrainState::default(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    pub fn step(&self) -> usize {
        self.state.step
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// Replaces parameters and optimizer state with a checkpoint's, resuming at its step.
    pub fn restore<S: ObjectStore>(&mut self, checkpointer: &Checkpointer<S>) -> Result<TrainMetrics> {
        let (report, metrics) = checkpointer.read_train(&mut self.ctx.store_mut())?;
        self.state = TrainState {
            step: metrics.current_step,
            top_loss: metrics.loss,
            loss: metrics.loss,
            accuracy: metrics.accuracy,
        };
        info!(
            rank = self.rank(),
            step = metrics.current_step,
            loaded = report.loaded,
            "resumed from checkpoint"
        );
        Ok(metrics)
    }

    /// Saves parameters, optimizer state and the latest metrics. Only rank 0
    /// writes the structure file.
    pub fn save<S: ObjectStore>(&self, checkpointer: &Checkpointer<S>) -> Result<()> {
        checkpointer.write_train(&self.ctx.store(), &self.state.metrics(), self.rank() == 0)?;
        info!(step = self.state.step, "checkpoint written");
        Ok(())
    }

    /// Forward, backward, gradient averaging and one optimizer update.
    pub fn train_step(&mut self, batch: &TokenBatch) -> Result<TrainState> {
        let mut ctx = self.ctx.with_fresh_bindings(true);
        let out = model::compute(&mut ctx, batch)?;

        let grads = if self.collective.world_size() > 1 {
            out.grads
                .iter()
                .map(|(name, grad)| Ok((name.clone(), self.collective.all_reduce_mean(grad)?)))
                .collect::<Result<BTreeMap<_, _>>>()?
        } else {
            out.grads
        };
        let local = Tensor::new(vec![out.top_loss, out.loss, out.accuracy], vec![3])?;
        let averaged = self.collective.all_reduce_mean(&local)?;

        self.optimizer.update(&self.ctx, &grads, self.state.step)?;
        self.state = TrainState {
            step: self.state.step + 1,
            top_loss: averaged.data()[0],
            loss: averaged.data()[1],
            accuracy: averaged.data()[2],
        };
        Ok(self.state)
    }

    /// Learning rate of the next step.
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate(self.state.step)
    }
}

/// Runs training over `devices` replicas, one thread each.
pub struct Trainer<S: ObjectStore = LocalStore> {
    config: Config,
    checkpointer: Option<Checkpointer<S>>,
}

impl Trainer<LocalStore> {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            checkpointer: None,
        })
    }
}

impl<S: ObjectStore> Trainer<S> {
    /// Sets where checkpoints are loaded from and written to.
    pub fn with_checkpointer<T: ObjectStore>(self, checkpointer: Checkpointer<T>) -> Trainer<T> {
        Trainer {
            config: self.config,
            checkpointer: Some(checkpointer),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn checkpointer(&self) -> Option<&Checkpointer<S>> {
        self.checkpointer.as_ref()
    }

    /// Trains until `training.steps` optimizer steps have been taken and
    /// returns rank 0's final state.
    pub fn run<T: TokenSource>(&self, batches: &mut TokenBatches<T>) -> Result<TrainState> {
        let devices = self.config.training.devices;
        let collectives: Vec<Box<dyn Collective>> = if devices == 1 {
            vec![Box::new(LocalCollective)]
        } else {
            CpuMesh::mesh(devices)
                .into_iter()
                .map(|mesh| Box::new(mesh) as Box<dyn Collective>)
                .collect()
        };
        info!(devices, steps = self.config.training.steps, "training started");

        std::thread::scope(|scope| {
            let mut senders = Vec::with_capacity(devices);
            let mut handles = Vec::with_capacity(devices);
            for collective in collectives {
                let (tx, rx) = bounded::<Vec<TokenBatch>>(1);
                senders.push(tx);
                let config = &self.config;
                let checkpointer = self.checkpointer.as_ref();
                handles.push(scope.spawn(move || replica_loop(config, collective, rx, checkpointer)));
            }

            let mut feed_error = None;
            'feed: for item in batches.by_ref() {
                let per_device = match item.and_then(|item| by_device(item, devices)) {
                    Ok(per_device) => per_device,
                    Err(e) => {
                        feed_error = Some(e);
                        break;
                    }
                };
                for (tx, device_batches) in senders.iter().zip(per_device) {
                    if tx.send(device_batches).is_err() {
                        break 'feed;
                    }
                }
            }
            drop(senders);

            let results: Vec<Result<TrainState>> = handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Collective("replica thread panicked".to_string())))
                })
                .collect();
            if let Some(e) = feed_error {
                return Err(e);
            }
            first_failure(results)
        })
    }
}

/// Rank 0's state, or the first error that is not a peer hanging up.
fn first_failure(results: Vec<Result<TrainState>>) -> Result<TrainState> {
    let mut hang_up = None;
    let mut state = None;
    for result in results {
        match result {
            Ok(s) => {
                state.get_or_insert(s);
            }
            Err(Error::Collective(reason)) => {
                hang_up.get_or_insert(Error::Collective(reason));
            }
            Err(e) => return Err(e),
        }
    }
    if let Some(e) = hang_up {
        return Err(e);
    }
    let state = state.ok_or_else(|| Error::Config("no replicas".to_string()))?;
    info!(step = state.step, loss = state.loss, "training finished");
    Ok(state)
}

/// `[inner_steps][devices]` to `[devices][inner_steps]`.
fn by_device(item: Vec<Vec<TokenBatch>>, devices: usize) -> Result<Vec<Vec<TokenBatch>>> {
    let mut per_device: Vec<Vec<TokenBatch>> = (0..devices).map(|_| Vec::with_capacity(item.len())).collect();
    for step in item {
        if step.len() != devices {
            return Err(Error::Data(format!("batch for {} devices, expected {devices}", step.len())));
        }
        for (device, batch) in step.into_iter().enumerate() {
            per_device[device].push(batch);
        }
    }
    Ok(per_device)
}

fn replica_loop<C: Collective, S: ObjectStore>(
    config: &Config,
    collective: C,
    batches: Receiver<Vec<TokenBatch>>,
    checkpointer: Option<&Checkpointer<S>>,
) -> Result<TrainState> {
    let first = batches
        .recv()
        .map_err(|_| Error::Data("batch iterator ended before the first step".to_string()))?;
    let sample = first
        .first()
        .ok_or_else(|| Error::Data("empty batch".to_string()))?;
    let mut replica = Replica::new(config.clone(), collective, sample)?;

    if let Some(checkpointer) = checkpointer {
        if config.checkpoint.load && checkpointer.exists() {
            replica.restore(checkpointer)?;
        }
    }

    let training = &config.training;
    let mut last_saved = replica.step();
    let mut pending = Some(first);
    while replica.step() < training.steps {
        let item = match pending.take() {
            Some(item) => item,
            None => match batches.recv() {
                Ok(item) => item,
                Err(_) => break,
            },
        };
        for batch in &item {
            if replica.step() >= training.steps {
                break;
            }
            let lr = replica.learning_rate();
            let state = replica.train_step(batch)?;
            if replica.rank() != 0 {
                continue;
            }
            if training.print_interval > 0 && state.step % training.print_interval == 0 {
                info!(
                    step = state.step,
                    loss = state.loss,
                    top_loss = state.top_loss,
                    accuracy = state.accuracy,
                    lr,
                    "train"
                );
            }
            if let Some(checkpointer) = checkpointer {
                if training.checkpoint_interval > 0 && state.step % training.checkpoint_interval == 0 {
                    replica.save(checkpointer)?;
                    last_saved = state.step;
                }
            }
        }
    }

    if let Some(checkpointer) = checkpointer {
        if replica.rank() == 0 && replica.step() != last_saved {
            replica.save(checkpointer)?;
        }
    }
    Ok(replica.state())
}
