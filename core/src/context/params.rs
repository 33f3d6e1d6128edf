//! Parameter store and parameter declarations.

use crate::config::dims::HEADS;
use crate::error::{Error, Result};
use crate::tensor::{StorageDtype, Tensor};
use std::collections::BTreeMap;

/// Marker contained in the names of optimizer state entries.
pub const OPTIMIZER_MARKER: &str = "optimizer";

/// Everything the optimizer and checkpointing need to know about a parameter
/// besides its value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamMeta {
    /// Symbolic dims, one per axis.
    pub dims: Vec<String>,
    /// Learning-rate scale, `lr_scale * scale` at declaration.
    pub variance: f64,
    /// The leading axis stacks independent slices (per head, per expert, ...).
    pub stacked: bool,
    /// Normalization or rescale parameter; excluded from Shampoo and weight decay.
    pub small: bool,
    /// Axis split across checkpoint shards.
    pub shard_axis: Option<usize>,
    pub dtype: StorageDtype,
}

impl ParamMeta {
    /// Metadata for optimizer state mirroring `owner`.
    pub fn state_of(owner: &ParamMeta, dims: Vec<String>, dtype: StorageDtype) -> Self {
        let shard_axis = dims.iter().position(|d| d == HEADS);
        Self {
            dims,
            variance: owner.variance,
            stacked: owner.stacked,
            small: owner.small,
            shard_axis,
            dtype,
        }
    }
}

/// Flat, name-sorted mapping of every parameter and optimizer state tensor.
///
/// Values are stored at their declared precision; reads always hand out `f32`.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    values: BTreeMap<String, Tensor>,
    meta: BTreeMap<String, ParamMeta>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    pub fn meta(&self, name: &str) -> Option<&ParamMeta> {
        self.meta.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.values.iter()
    }

    /// Names of model parameters, skipping optimizer state.
    pub fn model_names(&self) -> Vec<String> {
        self.values
            .keys()
            .filter(|name| !is_optimizer_state(name))
            .cloned()
            .collect()
    }

    /// Inserts a new entry, rounding it to `meta.dtype`.
    pub fn insert(&mut self, name: impl Into<String>, value: Tensor, meta: ParamMeta) {
        let name = name.into();
        let value = meta.dtype.round(&value);
        self.values.insert(name.clone(), value);
        self.meta.insert(name, meta);
    }

    /// Replaces the value of an existing entry; shape and metadata are fixed.
    pub fn set(&mut self, name: &str, value: Tensor) -> Result<()> {
        let meta = self
            .meta
            .get(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        let slot = self
            .values
            .get_mut(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        if slot.shape() != value.shape() {
            return Err(crate::tensor::TensorError::ShapeMismatch {
                expected: slot.shape().to_vec(),
                got: value.shape().to_vec(),
            }
            .into());
        }
        *slot = meta.dtype.round(&value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.meta.remove(name);
        self.values.remove(name)
    }

    /// Learning-rate scale per parameter, the parallel "variance" mapping.
    pub fn variances(&self) -> BTreeMap<String, f64> {
        self.meta
            .iter()
            .map(|(name, meta)| (name.clone(), meta.variance))
            .collect()
    }

    pub fn set_variance(&mut self, name: &str, variance: f64) -> Result<()> {
        let meta = self
            .meta
            .get_mut(name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        meta.variance = variance;
        Ok(())
    }
}

pub fn is_optimizer_state(name: &str) -> bool {
    name.contains(OPTIMIZER_MARKER)
}

/// How a missing parameter is materialized.
#[derive(Debug, Clone, PartialEq)]
pub enum InitPolicy {
    /// Stacked orthogonal init. `split_dims = None` uses the configured default.
    Orthogonal {
        column_axes: usize,
        split_dims: Option<Vec<String>>,
    },
    /// `N(0, 1) * scale * std + mean`.
    Normal { mean: f64, std: f64 },
}

/// Declaration of a parameter at a call site.
///
/// ```rust
/// use revlm::context::ParamSpec;
///
/// let spec = ParamSpec::new("inp_weight", &["heads", "features_per_head", "intermediate"])
///     .scale(0.5)
///     .lr_scale(2.0);
/// assert_eq!(spec.dims().len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub(crate) name: String,
    pub(crate) dims: Vec<String>,
    pub(crate) init: InitPolicy,
    pub(crate) scale: f64,
    pub(crate) post_variance_scale: f64,
    pub(crate) lr_scale: f64,
    pub(crate) dtype: Option<StorageDtype>,
    pub(crate) small: bool,
    pub(crate) stacked: Option<bool>,
}

impl ParamSpec {
    pub fn new(name: &str, dims: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            init: InitPolicy::Orthogonal {
                column_axes: 1,
                split_dims: None,
            },
            scale: 1.0,
            post_variance_scale: 1.0,
            lr_scale: 1.0,
            dtype: None,
            small: false,
            stacked: None,
        }
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn normal(mut self, mean: f64, std: f64) -> Self {
        self.init = InitPolicy::Normal { mean, std };
        self
    }

    pub fn zeros(self) -> Self {
        self.normal(0.0, 0.0)
    }

    pub fn column_axes(mut self, column_axes: usize) -> Self {
        if let InitPolicy::Orthogonal { column_axes: axes, .. } = &mut self.init {
            *axes = column_axes;
        }
        self
    }

    pub fn split_dims(mut self, dims: &[&str]) -> Self {
        if let InitPolicy::Orthogonal { split_dims, .. } = &mut self.init {
            *split_dims = Some(dims.iter().map(|d| d.to_string()).collect());
        }
        self
    }

    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Extra factor on orthogonal init that does not enter the variance.
    pub fn post_variance_scale(mut self, factor: f64) -> Self {
        self.post_variance_scale = factor;
        self
    }

    pub fn lr_scale(mut self, lr_scale: f64) -> Self {
        self.lr_scale = lr_scale;
        self
    }

    pub fn dtype(mut self, dtype: StorageDtype) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Marks a normalization or rescale parameter.
    pub fn small(mut self) -> Self {
        self.small = true;
        self
    }

    /// Overrides whether the leading axis is a stacking axis.
    pub fn stacked(mut self, stacked: bool) -> Self {
        self.stacked = Some(stacked);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(dims: &[&str]) -> ParamMeta {
        ParamMeta {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            variance: 1.0,
            stacked: false,
            small: false,
            shard_axis: None,
            dtype: StorageDtype::F32,
        }
    }

    #[test]
    fn test_store_sorted_and_filtered() {
        let mut store = ParamStore::new();
        store.insert("/b", Tensor::zeros(&[1]), meta(&["one"]));
        store.insert("/a", Tensor::zeros(&[1]), meta(&["one"]));
        store.insert("/optimizer:0/a/momentum", Tensor::zeros(&[1]), meta(&["one"]));

        let names: Vec<_> = store.names().cloned().collect();
        assert_eq!(names, vec!["/a", "/b", "/optimizer:0/a/momentum"]);
        assert_eq!(store.model_names(), vec!["/a", "/b"]);
    }

    #[test]
    fn test_set_rounds_and_checks_shape() {
        let mut store = ParamStore::new();
        let mut m = meta(&["one"]);
        m.dtype = StorageDtype::Bf16;
        store.insert("/w", Tensor::zeros(&[1]), m);

        store.set("/w", Tensor::scalar(0.1).reshape(&[1]).unwrap()).unwrap();
        let stored = store.get("/w").unwrap().data()[0];
        assert_ne!(stored, 0.1);
        assert!((stored - 0.1).abs() < 1e-3);

        assert!(store.set("/w", Tensor::zeros(&[2])).is_err());
        assert!(matches!(
            store.set("/missing", Tensor::zeros(&[1])),
            Err(Error::UnknownParameter(_))
        ));
    }

    #[test]
    fn test_spec_builder() {
        let spec = ParamSpec::new("w", &["heads", "one"]).column_axes(2).split_dims(&[]).zeros();
        assert_eq!(spec.init, InitPolicy::Normal { mean: 0.0, std: 0.0 });
        let spec = ParamSpec::new("w", &["heads", "one"]).split_dims(&["depth"]).column_axes(2);
        assert_eq!(
            spec.init,
            InitPolicy::Orthogonal {
                column_axes: 2,
                split_dims: Some(vec!["depth".to_string()])
            }
        );
    }
}
