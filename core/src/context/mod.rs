//! Naming scopes, the shared parameter store, and parameter lookup.
//!
//! Every parameter is identified by the path of scopes it was declared under,
//! e.g. `/reversible:3/feed_forward:0/inp_weight`. The same forward code runs
//! twice with different [`Mode`]s: once in [`Mode::Init`] to discover and
//! materialize every parameter, then any number of times in [`Mode::Compute`]
//! where [`Context::get_param`] must resolve every name to an existing entry.
//!
//! ```rust
//! use revlm::config::Config;
//! use revlm::context::{Context, Mode, ParamSpec};
//!
//! let mut ctx = Context::new(Config::default(), Mode::Init);
//! let mut layer = ctx.add_to_prefix("layer");
//! layer.get_param(ParamSpec::new("scale", &["heads"]).zeros()).unwrap();
//! assert!(ctx.store().contains("/layer:0/scale"));
//!
//! // A sibling created after the first one gets the next suffix.
//! assert_eq!(ctx.add_to_prefix("layer").prefix(), "/layer:1");
//! ```
//!
//! # Scopes
//!
//! A [`Context`] owns its [`Scope`] (prefix plus name counters) but shares the
//! store, the random generator and the per-pass bindings with every context
//! derived from it. Deriving a child bumps the counter on the parent and hands
//! the child an independent snapshot of the counters.

use crate::autograd::Variable;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::trace;

pub mod init;
pub mod params;

pub use params::{InitPolicy, OPTIMIZER_MARKER, ParamMeta, ParamSpec, ParamStore, is_optimizer_state};

/// Which half of the two-phase protocol a pass belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Shapes only: parameters are created, compute is skipped.
    Init,
    /// Every parameter must already exist.
    Compute,
}

/// Naming state: a `/`-separated prefix and per-name disambiguation counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    prefix: String,
    name_cache: BTreeMap<String, usize>,
}

impl Scope {
    pub fn root() -> Self {
        Self::default()
    }

    /// Scope rooted at an arbitrary prefix with no counters.
    pub fn at(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name_cache: BTreeMap::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name_cache(&self) -> &BTreeMap<String, usize> {
        &self.name_cache
    }

    /// Fully qualified name of `name` under this scope.
    pub fn qualify(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    fn next_suffix(&mut self, name: &str) -> usize {
        let slot = self.name_cache.entry(name.to_string()).or_insert(0);
        let index = *slot;
        *slot += 1;
        index
    }

    /// Child scope `prefix/name:i`, drawing `i` from this scope's counter.
    pub fn child(&mut self, name: &str) -> Scope {
        let index = self.next_suffix(name);
        Scope {
            prefix: self.qualify(&format!("{name}:{index}")),
            name_cache: self.name_cache.clone(),
        }
    }
}

/// Parameter lookup context for one forward pass.
#[derive(Clone)]
pub struct Context {
    mode: Mode,
    scope: Scope,
    config: Rc<Config>,
    store: Rc<RefCell<ParamStore>>,
    rng: Rc<RefCell<StdRng>>,
    bindings: Rc<RefCell<Bindings>>,
}

/// Parameters handed out during one pass.
#[derive(Default)]
struct Bindings {
    track_grads: bool,
    leaves: BTreeMap<String, Variable>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("mode", &self.mode)
            .field("prefix", &self.scope.prefix)
            .field("parameters", &self.store.borrow().len())
            .finish()
    }
}

impl Context {
    /// Fresh context over an empty store, seeded from `config.model.seed`.
    pub fn new(config: Config, mode: Mode) -> Self {
        Self::with_store(Rc::new(config), Rc::new(RefCell::new(ParamStore::new())), mode)
    }

    /// Context over an existing store.
    pub fn with_store(config: Rc<Config>, store: Rc<RefCell<ParamStore>>, mode: Mode) -> Self {
        let rng = StdRng::seed_from_u64(config.model.seed);
        Self {
            mode,
            scope: Scope::root(),
            config,
            store,
            rng: Rc::new(RefCell::new(rng)),
            bindings: Rc::new(RefCell::new(Bindings {
                track_grads: mode == Mode::Compute,
                leaves: BTreeMap::new(),
            })),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_initializing(&self) -> bool {
        self.mode == Mode::Init
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_rc(&self) -> Rc<Config> {
        Rc::clone(&self.config)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn prefix(&self) -> &str {
        self.scope.prefix()
    }

    pub fn store(&self) -> Ref<'_, ParamStore> {
        self.store.borrow()
    }

    pub fn store_mut(&self) -> RefMut<'_, ParamStore> {
        self.store.borrow_mut()
    }

    pub fn store_rc(&self) -> Rc<RefCell<ParamStore>> {
        Rc::clone(&self.store)
    }

    pub fn rng(&self) -> RefMut<'_, StdRng> {
        self.rng.borrow_mut()
    }

    /// Counted child scope `prefix/name:i`.
    pub fn add_to_prefix(&mut self, name: &str) -> Context {
        let scope = self.scope.child(name);
        Context {
            scope,
            ..self.clone()
        }
    }

    /// Fully qualified name of `name` without touching any counter.
    pub fn prefixed(&self, name: &str) -> String {
        self.scope.qualify(name)
    }

    /// Same context with its scope replaced by `snapshot`.
    pub fn with_scope(&self, snapshot: Scope) -> Context {
        Context {
            scope: snapshot,
            ..self.clone()
        }
    }

    /// Takes over the counters a child accumulated.
    pub fn adopt_names(&mut self, child: &Context) {
        self.scope.name_cache = child.scope.name_cache.clone();
    }

    /// Same scope and store with an empty set of bindings, so parameter
    /// gradients of a sub-computation can be collected on their own.
    pub fn with_fresh_bindings(&self, track_grads: bool) -> Context {
        Context {
            bindings: Rc::new(RefCell::new(Bindings {
                track_grads,
                leaves: BTreeMap::new(),
            })),
            ..self.clone()
        }
    }

    /// Gradients of every parameter bound during this pass that received one.
    pub fn take_param_grads(&self) -> BTreeMap<String, Tensor> {
        self.bindings
            .borrow()
            .leaves
            .iter()
            .filter_map(|(name, leaf)| leaf.take_grad().map(|g| (name.clone(), g)))
            .collect()
    }

    /// Names bound during this pass.
    pub fn bound_names(&self) -> Vec<String> {
        self.bindings.borrow().leaves.keys().cloned().collect()
    }

    /// Resolves a parameter, materializing it in [`Mode::Init`].
    ///
    /// In [`Mode::Compute`] the first lookup of a name in a pass binds it as a
    /// gradient-tracking leaf; later lookups return that same leaf so
    /// gradients from every use accumulate in one place.
    pub fn get_param(&mut self, spec: ParamSpec) -> Result<Variable> {
        let name = self.prefixed(&spec.name);
        if let Some(bound) = self.bindings.borrow().leaves.get(&name) {
            return Ok(bound.clone());
        }

        if !self.store.borrow().contains(&name) {
            if self.mode == Mode::Compute {
                return Err(Error::UnknownParameter(name));
            }
            self.materialize(&name, &spec)?;
        }

        let value = self
            .store
            .borrow()
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::UnknownParameter(name.clone()))?;
        let mut bindings = self.bindings.borrow_mut();
        let var = if bindings.track_grads {
            Variable::leaf(value)
        } else {
            Variable::constant(value)
        };
        bindings.leaves.insert(name, var.clone());
        Ok(var)
    }

    /// Zero-initialized parameter.
    pub fn zero_param(&mut self, name: &str, dims: &[&str]) -> Result<Variable> {
        self.get_param(ParamSpec::new(name, dims).zeros())
    }

    /// Overwrites an existing entry under this scope.
    pub fn assign(&self, name: &str, value: Tensor) -> Result<()> {
        self.store.borrow_mut().set(&self.prefixed(name), value)
    }

    fn materialize(&mut self, name: &str, spec: &ParamSpec) -> Result<()> {
        let config = Rc::clone(&self.config);
        let shape = spec
            .dims
            .iter()
            .map(|d| config.dim(d))
            .collect::<Result<Vec<_>>>()?;

        let value = {
            let mut rng = self.rng.borrow_mut();
            match &spec.init {
                InitPolicy::Orthogonal {
                    column_axes,
                    split_dims,
                } => {
                    let split_dims = split_dims
                        .as_ref()
                        .unwrap_or(&config.initializer.split_dims);
                    let factor = (spec.scale * spec.post_variance_scale) as f32;
                    init::stacked_orthogonal(&mut rng, &config, &spec.dims, *column_axes, split_dims)?
                        .scale(factor)
                }
                InitPolicy::Normal { mean, std } => init::normal(&mut rng, &shape)
                    .scale((spec.scale * std) as f32)
                    .add_scalar(*mean as f32),
            }
        };

        let leading_split = spec
            .dims
            .first()
            .is_some_and(|d| config.initializer.split_dims.contains(d));
        let meta = ParamMeta {
            dims: spec.dims.clone(),
            variance: spec.lr_scale * spec.scale,
            stacked: spec.stacked.unwrap_or(leading_split),
            small: spec.small,
            shard_axis: spec.dims.iter().position(|d| d == crate::config::dims::HEADS),
            dtype: spec.dtype.unwrap_or(config.model.storage_dtype),
        };
        trace!(name, shape = ?shape, "initialized parameter");
        self.store.borrow_mut().insert(name, value, meta);
        Ok(())
    }
}
