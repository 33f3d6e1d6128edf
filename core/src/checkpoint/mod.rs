//! Sharded checkpoints.
//!
//! A checkpoint is a directory of `.npz` archives:
//!
//! ```text
//! <path>/structure.json               {"<name>": null, ...}
//! <path>/layout.json                  shard count, split axis and dtype per name
//! <path>/<shard>/parameters.npz       arrays "0", "1", ... in name order
//! <path>/<shard>/variance.npz         per-parameter learning-rate scale
//! <path>/<shard>/{loss,accuracy,current_step}.npz   train checkpoints only
//! ```
//!
//! Tensors with a shard axis (their `heads` axis) are split evenly across
//! shards; the rest are replicated. `layout.json` records the shard count
//! and axes, so a checkpoint written with one shard count is read back
//! without knowing it. Values are saved as `f32` (bf16 widens exactly) and
//! the step counter as `i64`.
//!
//! Uploads are retried [`UPLOAD_RETRIES`] times and are fatal afterwards.
//! Downloads run concurrently, one thread per local device.

use crate::config::CheckpointConfig;
use crate::context::{ParamMeta, ParamStore, is_optimizer_state};
use crate::error::{Error, Result};
use crate::tensor::{StorageDtype, Tensor};
use ndarray::{ArrayD, IxDyn, arr1};
use ndarray_npy::{NpzReader, NpzWriter};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub mod store;

pub use store::{LocalStore, MemoryStore, ObjectStore};

pub const UPLOAD_RETRIES: usize = 8;
pub const STRUCTURE_FILE: &str = "structure.json";
pub const LAYOUT_FILE: &str = "layout.json";

const PARAMETERS: &str = "parameters";
const VARIANCE: &str = "variance";
const LOSS: &str = "loss";
const ACCURACY: &str = "accuracy";
const CURRENT_STEP: &str = "current_step";

/// Scalars saved next to the parameters of a training run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainMetrics {
    pub loss: f32,
    pub accuracy: f32,
    pub current_step: usize,
}

/// Outcome of merging a checkpoint into a parameter store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Entries overwritten in the store.
    pub loaded: usize,
    /// In the checkpoint but not in the store.
    pub unknown: Vec<String>,
    /// In the store but not in the checkpoint.
    pub unfilled: Vec<String>,
}

/// How a checkpoint's parameters are split across shards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub shards: usize,
    pub tensors: BTreeMap<String, TensorLayout>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorLayout {
    /// Axis the tensor is split along, `None` when replicated.
    pub axis: Option<usize>,
    pub dtype: StorageDtype,
}

/// One logical tensor read back from a checkpoint.
#[derive(Debug, Clone)]
struct Entry {
    tensor: Tensor,
    dtype: StorageDtype,
    axis: Option<usize>,
}

/// Writes and reads checkpoints on an [`ObjectStore`].
pub struct Checkpointer<S: ObjectStore> {
    store: S,
    config: CheckpointConfig,
}

impl<S: ObjectStore> Checkpointer<S> {
    pub fn new(store: S, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether a checkpoint exists at all.
    pub fn exists(&self) -> bool {
        self.store.exists(STRUCTURE_FILE)
    }

    /// Writes parameters and variance. Only the main process writes the
    /// structure and layout descriptors.
    pub fn write(&self, params: &ParamStore, is_main: bool) -> Result<()> {
        let names: Vec<String> = params.names().cloned().collect();
        let shards = self.config.shards.max(1);
        let mut layout = Layout {
            shards,
            tensors: BTreeMap::new(),
        };
        let mut parameters = Vec::with_capacity(names.len());
        let mut variance = Vec::with_capacity(names.len());
        for name in &names {
            let (value, meta) = match (params.get(name), params.meta(name)) {
                (Some(value), Some(meta)) => (value, meta),
                _ => return Err(Error::UnknownParameter(name.clone())),
            };
            parameters.push((value.clone(), meta.shard_axis));
            variance.push((Tensor::new(vec![meta.variance as f32], vec![1])?, None));
            layout.tensors.insert(
                name.clone(),
                TensorLayout {
                    axis: meta.shard_axis,
                    dtype: meta.dtype,
                },
            );
        }

        if is_main {
            let structure: serde_json::Map<String, serde_json::Value> = names
                .iter()
                .map(|name| (name.clone(), serde_json::Value::Null))
                .collect();
            info!(path = %self.config.path.display(), "writing {STRUCTURE_FILE}");
            self.upload(STRUCTURE_FILE, serde_json::to_vec(&serde_json::Value::Object(structure))?)?;
            self.upload(LAYOUT_FILE, serde_json::to_vec(&layout)?)?;
        }

        for shard in 0..shards {
            info!(shard, shards, "uploading shard");
            for (tensors, suffix) in [(&parameters, PARAMETERS), (&variance, VARIANCE)] {
                let sliced = tensors
                    .iter()
                    .map(|(tensor, axis)| slice_shard(tensor, *axis, shard, shards))
                    .collect::<Result<Vec<_>>>()?;
                self.upload(&shard_key(shard, suffix), encode_archive(&sliced)?)?;
            }
        }
        Ok(())
    }

    /// [`write`](Self::write) plus loss, accuracy and step counter.
    pub fn write_train(&self, params: &ParamStore, metrics: &TrainMetrics, is_main: bool) -> Result<()> {
        self.write(params, is_main)?;
        let shards = self.config.shards.max(1);
        for shard in 0..shards {
            for (suffix, value) in [(LOSS, metrics.loss), (ACCURACY, metrics.accuracy)] {
                let scalar = Tensor::new(vec![value], vec![1])?;
                self.upload(&shard_key(shard, suffix), encode_archive(&[scalar])?)?;
            }
            self.upload(&shard_key(shard, CURRENT_STEP), encode_step(metrics.current_step)?)?;
        }
        Ok(())
    }

    /// Merges the checkpoint's parameters into `params`, and the variance of
    /// non-optimizer entries if `load_variance`.
    ///
    /// An empty store takes every entry. Otherwise only names already in the
    /// store are overwritten, names matching `ignore_pattern` are left alone,
    /// and mismatches in either direction are logged.
    pub fn read(&self, params: &mut ParamStore, load_variance: bool) -> Result<LoadReport> {
        let ignore = compile_ignore(&self.config.ignore_pattern)?;
        let names = self.read_structure()?;
        let layout = self.read_layout()?;
        let tensor_layout = |name: &str| layout.tensors.get(name).copied().unwrap_or_default();

        let axes: Vec<Option<usize>> = names.iter().map(|name| tensor_layout(name).axis).collect();
        let loaded = self.read_unsharded(PARAMETERS, layout.shards, &axes)?;
        let incoming: BTreeMap<String, Entry> = names
            .iter()
            .zip(loaded)
            .map(|(name, tensor)| {
                let TensorLayout { axis, dtype } = tensor_layout(name);
                (name.clone(), Entry { tensor, dtype, axis })
            })
            .collect();
        let report = merge(incoming, params, ignore.as_ref())?;

        if load_variance {
            let variances = self.read_unsharded(VARIANCE, layout.shards, &vec![None; names.len()])?;
            for (name, tensor) in names.iter().zip(variances) {
                if is_optimizer_state(name) || !params.contains(name) {
                    continue;
                }
                if ignore.as_ref().is_some_and(|re| re.is_match(name)) {
                    continue;
                }
                params.set_variance(name, tensor.data().first().copied().unwrap_or(1.0) as f64)?;
            }
        }
        Ok(report)
    }

    /// [`read`](Self::read) with variance, plus the saved training scalars.
    pub fn read_train(&self, params: &mut ParamStore) -> Result<(LoadReport, TrainMetrics)> {
        let scalar = |suffix: &str| -> Result<f32> {
            let key = shard_key(0, suffix);
            decode_archive(self.store.get(&key)?, &key)?
                .first()
                .and_then(|t| t.data().first().copied())
                .ok_or_else(|| Error::Checkpoint(format!("{key} is empty")))
        };
        let step_key = shard_key(0, CURRENT_STEP);
        let metrics = TrainMetrics {
            loss: scalar(LOSS)?,
            accuracy: scalar(ACCURACY)?,
            current_step: decode_step(self.store.get(&step_key)?, &step_key)?,
        };
        let report = self.read(params, true)?;
        Ok((report, metrics))
    }

    /// The layout descriptor of the stored checkpoint.
    pub fn read_layout(&self) -> Result<Layout> {
        let layout: Layout = serde_json::from_slice(&self.store.get(LAYOUT_FILE)?)?;
        if layout.shards == 0 {
            return Err(Error::Checkpoint(format!("{LAYOUT_FILE} lists zero shards")));
        }
        Ok(layout)
    }

    fn read_structure(&self) -> Result<Vec<String>> {
        let bytes = self.store.get(STRUCTURE_FILE)?;
        match serde_json::from_slice::<serde_json::Value>(&bytes)? {
            serde_json::Value::Object(map) => {
                let mut names: Vec<String> = map.into_iter().map(|(name, _)| name).collect();
                names.sort();
                Ok(names)
            }
            other => Err(Error::Checkpoint(format!("{STRUCTURE_FILE} is not an object: {other}"))),
        }
    }

    fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut reason = String::new();
        for attempt in 1..=UPLOAD_RETRIES {
            match self.store.put(key, &bytes) {
                Ok(()) => {
                    debug!(key, attempt, bytes = bytes.len(), "uploaded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "upload failed, trying again");
                    reason = e.to_string();
                    if self.config.retry_delay_ms > 0 {
                        std::thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
                    }
                }
            }
        }
        Err(Error::UploadFailed {
            key: key.to_string(),
            attempts: UPLOAD_RETRIES,
            reason,
        })
    }

    /// Downloads every shard of `suffix` and concatenates along `axes`.
    fn read_unsharded(&self, suffix: &str, shards: usize, axes: &[Option<usize>]) -> Result<Vec<Tensor>> {
        let start = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.local_device_count.max(1))
            .build()
            .map_err(|e| Error::Checkpoint(format!("download pool: {e}")))?;
        let per_shard = pool.install(|| {
            (0..shards)
                .into_par_iter()
                .map(|shard| {
                    let key = shard_key(shard, suffix);
                    decode_archive(self.store.get(&key)?, &key)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        info!(suffix, shards, elapsed = ?start.elapsed(), "loaded shards");

        if per_shard.iter().any(|tensors| tensors.len() != axes.len()) {
            return Err(Error::Checkpoint(format!(
                "{suffix}: structure lists {} tensors, archives disagree",
                axes.len()
            )));
        }

        axes.iter()
            .enumerate()
            .map(|(index, axis)| match axis {
                Some(axis) => {
                    let parts: Vec<Tensor> = per_shard.iter().map(|s| s[index].clone()).collect();
                    Ok(Tensor::concat(&parts, *axis)?)
                }
                None => Ok(per_shard[0][index].clone()),
            })
            .collect()
    }
}

fn shard_key(shard: usize, suffix: &str) -> String {
    format!("{shard}/{suffix}.npz")
}

/// `None` for an empty pattern. Patterns match from the start of a name.
fn compile_ignore(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(&format!("^(?:{pattern})"))?))
}

fn slice_shard(tensor: &Tensor, axis: Option<usize>, shard: usize, shards: usize) -> Result<Tensor> {
    let Some(axis) = axis else {
        return Ok(tensor.clone());
    };
    let dim = tensor.shape().get(axis).copied().unwrap_or(0);
    if dim % shards != 0 {
        return Err(Error::Checkpoint(format!(
            "axis {axis} of {:?} does not split into {shards} shards",
            tensor.shape()
        )));
    }
    let len = dim / shards;
    Ok(tensor.narrow(axis, shard * len, len)?)
}

/// An npz archive holding `tensors` as `f32` arrays "0", "1", ...
fn encode_archive(tensors: &[Tensor]) -> Result<Vec<u8>> {
    let mut npz = NpzWriter::new(Cursor::new(Vec::new()));
    for (index, tensor) in tensors.iter().enumerate() {
        let array = ArrayD::from_shape_vec(IxDyn(tensor.shape()), tensor.data().to_vec())
            .map_err(|e| Error::Checkpoint(format!("array {index}: {e}")))?;
        npz.add_array(index.to_string(), &array)?;
    }
    Ok(npz.finish()?.into_inner())
}

fn encode_step(step: usize) -> Result<Vec<u8>> {
    let step = i64::try_from(step).map_err(|_| Error::Checkpoint(format!("step {step} overflows i64")))?;
    let mut npz = NpzWriter::new(Cursor::new(Vec::new()));
    npz.add_array("0", &arr1(&[step]))?;
    Ok(npz.finish()?.into_inner())
}

/// Array names ordered by their numeric key.
fn archive_names<R: Read + Seek>(npz: &mut NpzReader<R>, key: &str) -> Result<Vec<String>> {
    let mut indexed = npz
        .names()?
        .into_iter()
        .map(|name| {
            let index = name
                .strip_suffix(".npy")
                .unwrap_or(name.as_str())
                .parse::<usize>()
                .map_err(|_| Error::Checkpoint(format!("{key}: unexpected array `{name}`")))?;
            Ok((index, name))
        })
        .collect::<Result<Vec<_>>>()?;
    indexed.sort();
    Ok(indexed.into_iter().map(|(_, name)| name).collect())
}

fn decode_archive(bytes: Vec<u8>, key: &str) -> Result<Vec<Tensor>> {
    let mut npz = NpzReader::new(Cursor::new(bytes))?;
    let names = archive_names(&mut npz, key)?;
    names
        .iter()
        .map(|name| {
            let array: ArrayD<f32> = npz.by_name(name)?;
            Ok(Tensor::new(array.iter().copied().collect(), array.shape().to_vec())?)
        })
        .collect()
}

fn decode_step(bytes: Vec<u8>, key: &str) -> Result<usize> {
    let mut npz = NpzReader::new(Cursor::new(bytes))?;
    let name = archive_names(&mut npz, key)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Checkpoint(format!("{key} is empty")))?;
    let array: ArrayD<i64> = npz.by_name(&name)?;
    let step = array
        .iter()
        .next()
        .copied()
        .ok_or_else(|| Error::Checkpoint(format!("{key} is empty")))?;
    usize::try_from(step).map_err(|_| Error::Checkpoint(format!("{key}: negative step {step}")))
}

/// Overwrites `params` with `incoming`; see [`Checkpointer::read`].
fn merge(incoming: BTreeMap<String, Entry>, params: &mut ParamStore, ignore: Option<&Regex>) -> Result<LoadReport> {
    let ignored = |name: &str| ignore.is_some_and(|re| re.is_match(name));

    if params.is_empty() {
        info!(entries = incoming.len(), "store is empty, importing every checkpoint entry");
        let loaded = incoming.len();
        for (name, entry) in incoming {
            let meta = ParamMeta {
                dims: Vec::new(),
                variance: 1.0,
                stacked: false,
                small: false,
                shard_axis: entry.axis,
                dtype: entry.dtype,
            };
            params.insert(name, entry.tensor, meta);
        }
        return Ok(LoadReport {
            loaded,
            ..LoadReport::default()
        });
    }

    let unknown: Vec<String> = incoming
        .keys()
        .filter(|name| !params.contains(name) && !ignored(name))
        .cloned()
        .collect();
    let unfilled: Vec<String> = params
        .names()
        .filter(|name| !incoming.contains_key(*name) && !ignored(name))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        warn!(?unknown, "checkpoint entries without a parameter");
    }
    if !unfilled.is_empty() {
        warn!(?unfilled, "parameters missing from checkpoint");
    }

    let mut loaded = 0;
    for (name, entry) in incoming {
        if ignored(&name) || !params.contains(&name) {
            continue;
        }
        params.set(&name, entry.tensor)?;
        loaded += 1;
    }
    info!(loaded, "checkpoint merged");
    Ok(LoadReport {
        loaded,
        unknown,
        unfilled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(axis: Option<usize>, dtype: StorageDtype) -> ParamMeta {
        ParamMeta {
            dims: Vec::new(),
            variance: 0.5,
            stacked: false,
            small: false,
            shard_axis: axis,
            dtype,
        }
    }

    fn params() -> ParamStore {
        let mut store = ParamStore::new();
        store.insert("/a", Tensor::from_fn(&[4, 3], |i| i as f32), meta(Some(0), StorageDtype::F32));
        store.insert("/b", Tensor::from_fn(&[2], |i| i as f32 * 0.5), meta(None, StorageDtype::Bf16));
        store.insert(
            "/optimizer:0/a/ema:0/momentum_buffer",
            Tensor::ones(&[4, 3]),
            meta(Some(0), StorageDtype::F32),
        );
        store
    }

    fn checkpointer(shards: usize) -> Checkpointer<MemoryStore> {
        let config = CheckpointConfig {
            shards,
            ..CheckpointConfig::default()
        };
        Checkpointer::new(MemoryStore::new(), config)
    }

    #[test]
    fn test_layout() {
        let ckpt = checkpointer(2);
        ckpt.write(&params(), true).unwrap();
        let keys = ckpt.store().keys();
        assert!(keys.contains(&"structure.json".to_string()));
        assert!(keys.contains(&"1/parameters.npz".to_string()));
        assert!(keys.contains(&"1/variance.npz".to_string()));

        let layout = ckpt.read_layout().unwrap();
        assert_eq!(layout.shards, 2);
        assert_eq!(layout.tensors["/a"].axis, Some(0));
        assert_eq!(layout.tensors["/b"].dtype, StorageDtype::Bf16);

        let tensors = decode_archive(ckpt.store().get("1/parameters.npz").unwrap(), "1/parameters.npz").unwrap();
        assert_eq!(tensors.len(), 3);
        assert_eq!(tensors[0].shape(), &[2, 3]);
        assert_eq!(tensors[0].data()[0], 6.0);
        assert_eq!(tensors[1].shape(), &[2]);
    }

    #[test]
    fn test_archive_is_a_zip_of_npy_arrays() {
        let bytes = encode_archive(&[Tensor::from_fn(&[2, 2], |i| i as f32)]).unwrap();
        assert_eq!(&bytes[..4], b"PK\x03\x04");
        let mut npz = NpzReader::new(Cursor::new(bytes)).unwrap();
        let array: ArrayD<f32> = npz.by_name("0").unwrap();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_step_counter_is_exact() {
        for step in [0, (1 << 24) + 1, 1 << 30] {
            assert_eq!(decode_step(encode_step(step).unwrap(), "step").unwrap(), step);
        }
    }

    #[test]
    fn test_round_trip_into_empty_store() {
        let ckpt = checkpointer(2);
        let original = params();
        ckpt.write(&original, true).unwrap();
        let mut restored = ParamStore::new();
        let report = ckpt.read(&mut restored, false).unwrap();
        assert_eq!(report.loaded, 3);
        for name in original.names() {
            assert_eq!(restored.get(name), original.get(name), "{name}");
        }
    }

    #[test]
    fn test_ignore_pattern_protects_optimizer_state() {
        let ckpt = checkpointer(1);
        ckpt.write(&params(), true).unwrap();

        let mut target = params();
        target.set("/a", Tensor::zeros(&[4, 3])).unwrap();
        target
            .set("/optimizer:0/a/ema:0/momentum_buffer", Tensor::zeros(&[4, 3]))
            .unwrap();
        target.insert("/c", Tensor::zeros(&[1]), meta(None, StorageDtype::F32));
        target.set_variance("/a", 9.0).unwrap();
        let report = ckpt.read(&mut target, true).unwrap();

        assert_eq!(report.loaded, 2);
        assert_eq!(report.unfilled, vec!["/c".to_string()]);
        assert!(report.unknown.is_empty());
        assert_eq!(target.get("/a"), params().get("/a"));
        assert_eq!(
            target.get("/optimizer:0/a/ema:0/momentum_buffer"),
            Some(&Tensor::zeros(&[4, 3]))
        );
        assert_eq!(target.meta("/a").unwrap().variance, 0.5);
    }

    #[test]
    fn test_train_metrics() {
        let ckpt = checkpointer(1);
        let metrics = TrainMetrics {
            loss: 2.5,
            accuracy: 0.25,
            current_step: 16_777_217,
        };
        ckpt.write_train(&params(), &metrics, true).unwrap();
        let mut target = params();
        let (_, restored) = ckpt.read_train(&mut target).unwrap();
        assert_eq!(restored, metrics);
    }

    #[test]
    fn test_non_main_skips_structure() {
        let ckpt = checkpointer(1);
        ckpt.write(&params(), false).unwrap();
        assert!(!ckpt.exists());
        assert!(ckpt.store().exists("0/parameters.npz"));
    }

    #[test]
    fn test_ignore_regex_is_anchored() {
        let re = compile_ignore(".*optimizer.*").unwrap().unwrap();
        assert!(re.is_match("/optimizer:0/a"));
        let re = compile_ignore("optimizer").unwrap().unwrap();
        assert!(!re.is_match("/optimizer:0/a"));
        assert!(compile_ignore("").unwrap().is_none());
    }
}
