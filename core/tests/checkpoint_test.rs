use revlm::checkpoint::{Checkpointer, LocalStore, MemoryStore, ObjectStore, TrainMetrics, UPLOAD_RETRIES};
use revlm::config::CheckpointConfig;
use revlm::context::{ParamMeta, ParamStore};
use revlm::error::{Error, Result};
use revlm::tensor::{StorageDtype, Tensor};
use std::sync::atomic::{AtomicUsize, Ordering};

fn meta(dims: &[&str], shard_axis: Option<usize>, dtype: StorageDtype) -> ParamMeta {
    ParamMeta {
        dims: dims.iter().map(|d| d.to_string()).collect(),
        variance: 0.25,
        stacked: shard_axis == Some(0),
        small: false,
        shard_axis,
        dtype,
    }
}

fn params() -> ParamStore {
    let mut store = ParamStore::new();
    store.insert(
        "/attention:0/w_q",
        Tensor::from_fn(&[4, 3, 2], |i| i as f32 * 0.125 - 1.0),
        meta(&["heads", "features_per_head", "one"], Some(0), StorageDtype::F32),
    );
    store.insert(
        "/embed:0/w",
        Tensor::from_fn(&[5, 4, 3], |i| (i as f32).sin()),
        meta(&["vocab", "heads", "features_per_head"], Some(1), StorageDtype::Bf16),
    );
    store.insert(
        "/norm:0/scale",
        Tensor::full(&[3], 2.5),
        meta(&["features_per_head"], None, StorageDtype::F32),
    );
    store
}

fn config(dir: &std::path::Path, shards: usize) -> CheckpointConfig {
    CheckpointConfig {
        path: dir.to_path_buf(),
        shards,
        local_device_count: 2,
        ..CheckpointConfig::default()
    }
}

fn assert_same(a: &ParamStore, b: &ParamStore) {
    let names: Vec<_> = a.names().cloned().collect();
    assert_eq!(names, b.names().cloned().collect::<Vec<_>>());
    for name in &names {
        assert_eq!(a.get(name), b.get(name), "{name}");
    }
}

#[test]
fn test_round_trip_same_shard_count() {
    let dir = tempfile::tempdir().unwrap();
    let original = params();
    let writer = Checkpointer::new(LocalStore::new(dir.path()), config(dir.path(), 4));
    writer.write(&original, true).unwrap();
    assert!(dir.path().join("structure.json").is_file());
    assert!(dir.path().join("3").join("parameters.npz").is_file());

    let mut loaded = ParamStore::new();
    let report = writer.read(&mut loaded, true).unwrap();
    assert_eq!(report.loaded, 3);
    assert_same(&original, &loaded);
    assert_eq!(loaded.variances()["/embed:0/w"], 0.25);
}

#[test]
fn test_round_trip_different_shard_count() {
    let dir = tempfile::tempdir().unwrap();
    let original = params();
    Checkpointer::new(LocalStore::new(dir.path()), config(dir.path(), 2))
        .write(&original, true)
        .unwrap();

    for reader_shards in [1, 4] {
        let reader = Checkpointer::new(LocalStore::new(dir.path()), config(dir.path(), reader_shards));
        let mut loaded = ParamStore::new();
        reader.read(&mut loaded, false).unwrap();
        assert_same(&original, &loaded);
    }
}

#[test]
fn test_merge_reports_mismatches() {
    let store = MemoryStore::new();
    let ckpt = Checkpointer::new(&store, CheckpointConfig::default());
    ckpt.write(&params(), true).unwrap();

    let mut target = ParamStore::new();
    target.insert(
        "/norm:0/scale",
        Tensor::zeros(&[3]),
        meta(&["features_per_head"], None, StorageDtype::F32),
    );
    target.insert(
        "/new:0/bias",
        Tensor::zeros(&[2]),
        meta(&["one"], None, StorageDtype::F32),
    );
    let report = ckpt.read(&mut target, false).unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.unknown, vec!["/attention:0/w_q".to_string(), "/embed:0/w".to_string()]);
    assert_eq!(report.unfilled, vec!["/new:0/bias".to_string()]);
    assert_eq!(target.get("/norm:0/scale").unwrap().data(), &[2.5, 2.5, 2.5]);
    assert_eq!(target.get("/new:0/bias").unwrap().data(), &[0.0, 0.0]);
}

#[test]
fn test_train_metrics_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = Checkpointer::new(LocalStore::new(dir.path()), config(dir.path(), 2));
    let metrics = TrainMetrics {
        loss: 1.5,
        accuracy: 0.75,
        current_step: 16_777_217,
    };
    ckpt.write_train(&params(), &metrics, true).unwrap();
    assert!(dir.path().join("1").join("current_step.npz").is_file());

    let mut loaded = ParamStore::new();
    let (_, read) = ckpt.read_train(&mut loaded).unwrap();
    assert_eq!(read, metrics);
}

/// Fails the first `failures` puts.
struct FlakyStore {
    inner: MemoryStore,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }
}

impl ObjectStore for FlakyStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(Error::Checkpoint(format!("transient failure writing {key}")));
        }
        self.inner.put(key, bytes)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(key)
    }

    fn exists(&self, key: &str) -> bool {
        self.inner.exists(key)
    }
}

#[test]
fn test_upload_retries_transient_failures() {
    let store = FlakyStore::new(UPLOAD_RETRIES - 1);
    let ckpt = Checkpointer::new(&store, CheckpointConfig::default());
    ckpt.write(&params(), true).unwrap();
    assert!(ckpt.exists());
}

#[test]
fn test_upload_gives_up_after_retries() {
    let store = FlakyStore::new(usize::MAX);
    let ckpt = Checkpointer::new(&store, CheckpointConfig::default());
    match ckpt.write(&params(), true) {
        Err(Error::UploadFailed { key, attempts, .. }) => {
            assert_eq!(key, "structure.json");
            assert_eq!(attempts, UPLOAD_RETRIES);
        }
        other => panic!("expected UploadFailed, got {other:?}"),
    }
    assert_eq!(store.attempts.load(Ordering::SeqCst), UPLOAD_RETRIES);
}
