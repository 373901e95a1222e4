//! Memoization of grading steps.
//!
//! A step is keyed by its commands, the shape of its artifact declarations (paths and
//! flags, never contents) and the sandbox params that affect its result. The record
//! stored under that key is a [`CacheFingerprint`]: what the inputs hashed to when the
//! step last succeeded, and what it produced.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};

use crate::artifacts::{GradingArtifacts, InputSource};
use crate::digest::{self, Digest};
use crate::error::Result;
use crate::sandbox::RunLog;
use crate::storage::ContentStore;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Digest '{0}' is consumed before being produced")]
    ConsumedBeforeProduced(String),

    #[error("Digest '{0}' is produced more than once")]
    ProducedTwice(String),

    #[error(transparent)]
    Fs(#[from] fsutil::Error),
}

impl CacheError {
    /// Contract violations are programming or configuration errors, never cache misses.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ConsumedBeforeProduced(_) | Self::ProducedTwice(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFingerprint {
    /// Values of every output digest holder, in declaration order.
    pub digests: Vec<Option<Digest>>,
    /// Content hash of every input, in declaration order.
    pub fingerprints: Vec<Digest>,
    /// Hash of every path-only, non-intermediate output's destination (`None` if absent).
    pub output_fingerprints: Vec<Option<Digest>>,
    pub run_logs: Vec<Option<RunLog>>,
}

#[derive(Serialize)]
struct CacheKeyInput<'a> {
    commands: &'a [String],
    artifacts: Vec<GradingArtifacts>,
    extra_params: &'a serde_json::Value,
}

pub fn check_digests(batch: &[GradingArtifacts]) -> std::result::Result<(), CacheError> {
    let mut produced: HashSet<&str> = HashSet::new();
    for artifacts in batch {
        for input in &artifacts.inputs {
            let InputSource::Digest(holder) = &input.src else {
                continue;
            };
            if holder.value.is_none() && !produced.contains(holder.name.as_str()) {
                return Err(CacheError::ConsumedBeforeProduced(holder.name.clone()));
            }
        }
        for output in &artifacts.outputs {
            let Some(holder) = &output.digest else {
                continue;
            };
            if !produced.insert(holder.name.as_str()) {
                return Err(CacheError::ProducedTwice(holder.name.clone()));
            }
        }
    }
    Ok(())
}

pub fn cache_key(
    commands: &[String],
    batch: &[GradingArtifacts],
    extra_params: &serde_json::Value,
) -> Result<Digest> {
    let artifacts = batch
        .iter()
        .map(|a| {
            let mut shape = a.clone();
            shape.run_log = None;
            for input in &mut shape.inputs {
                if let InputSource::Digest(h) = &mut input.src {
                    h.value = None;
                }
            }
            for output in &mut shape.outputs {
                if let Some(h) = &mut output.digest {
                    h.value = None;
                    output.dest = None;
                }
            }
            shape
        })
        .collect();
    let json = serde_json::to_vec(&CacheKeyInput {
        commands,
        artifacts,
        extra_params,
    })?;
    Ok(digest::digest_bytes(json))
}

pub struct DependencyCache {
    records_dir: PathBuf,
    store: ContentStore,
    lock: Mutex<()>,
}

impl DependencyCache {
    pub const DIRNAME: &str = ".cache_db";

    pub fn open(box_dir: impl AsRef<Path>, store: ContentStore) -> fsutil::Result<Self> {
        let records_dir = box_dir.as_ref().join(Self::DIRNAME);
        fsutil::mkdir_all(&records_dir)?;
        Ok(Self {
            records_dir,
            store,
            lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Runs `step` unless an up-to-date record exists for it.
    ///
    /// `step` returns whether it succeeded; only successful steps whose outputs are all
    /// present get recorded. Returns `true` when the step is satisfied, either from the
    /// cache or by running.
    pub fn memoize<F>(
        &self,
        commands: &[String],
        extra_params: &serde_json::Value,
        batch: &mut [GradingArtifacts],
        step: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut [GradingArtifacts]) -> Result<bool>,
    {
        check_digests(batch)?;
        let key = cache_key(commands, batch, extra_params)?;

        if self.find_in_cache(&key, batch)? {
            log::info!("Cache hit for `{}`", commands.join(" && "));
            return Ok(true);
        }
        for a in batch.iter_mut() {
            a.cached = false;
        }

        if !step(batch)? {
            return Ok(false);
        }
        self.store_in_cache(&key, batch)?;
        Ok(true)
    }

    pub fn find_in_cache(&self, key: &Digest, batch: &mut [GradingArtifacts]) -> Result<bool> {
        let _guard = self.guard();

        let Some(record) = self.load(key) else {
            return Ok(false);
        };

        let current = self.fingerprint(batch)?;
        if record.fingerprints != current.fingerprints
            || record.output_fingerprints != current.output_fingerprints
            || record.digests.len() != current.digests.len()
            || record.run_logs.len() != current.run_logs.len()
        {
            log::debug!("Stale cache record {}", key);
            self.evict(key);
            return Ok(false);
        }

        let previous = holder_values(batch);
        set_holder_values(batch, &record.digests);
        if !self.artifacts_ok(batch) {
            set_holder_values(batch, &previous);
            log::warn!("Cache record {} points at missing outputs, evicting", key);
            self.evict(key);
            return Ok(false);
        }

        self.restore_hashed_copies(batch)?;
        for (a, run_log) in batch.iter_mut().zip(record.run_logs) {
            a.run_log = run_log;
            a.cached = true;
        }
        Ok(true)
    }

    pub fn store_in_cache(&self, key: &Digest, batch: &[GradingArtifacts]) -> Result<()> {
        let _guard = self.guard();
        if !self.artifacts_ok(batch) {
            log::debug!("Not caching {}: outputs incomplete", key);
            return Ok(());
        }
        let fp = self.fingerprint(batch)?;
        fsutil::write_json_with_mkdir(self.record_path(key), &fp)?;
        Ok(())
    }

    /// Every non-optional, non-intermediate output is still available.
    pub fn artifacts_ok(&self, batch: &[GradingArtifacts]) -> bool {
        batch.iter().all(|a| {
            a.outputs
                .iter()
                .filter(|o| !o.optional && !o.intermediate)
                .all(|o| {
                    if o.is_hashed() {
                        return o.digest_value().map_or(false, |d| self.store.exists(d));
                    }
                    let Some(dest) = &o.dest else {
                        return false;
                    };
                    fsutil::is_executable(a.resolve(dest)) == Some(o.executable)
                })
        })
    }

    fn fingerprint(&self, batch: &[GradingArtifacts]) -> Result<CacheFingerprint> {
        let mut fp = CacheFingerprint {
            digests: holder_values(batch),
            fingerprints: vec![],
            output_fingerprints: vec![],
            run_logs: batch.iter().map(|a| a.run_log.clone()).collect(),
        };
        for a in batch {
            for input in &a.inputs {
                let d = match &input.src {
                    InputSource::Path(p) => digest::digest_file(a.resolve(p))?,
                    InputSource::Digest(h) => match &h.value {
                        Some(d) => d.clone(),
                        None => return Err(CacheError::ConsumedBeforeProduced(h.name.clone()).into()),
                    },
                };
                fp.fingerprints.push(d);
            }
            for output in &a.outputs {
                if output.is_hashed() || output.intermediate {
                    continue;
                }
                let Some(dest) = &output.dest else {
                    continue;
                };
                let path = a.resolve(dest);
                let d = if path.is_file() {
                    Some(digest::digest_file(path)?)
                } else {
                    None
                };
                fp.output_fingerprints.push(d);
            }
        }
        Ok(fp)
    }

    fn restore_hashed_copies(&self, batch: &[GradingArtifacts]) -> Result<()> {
        for a in batch {
            for o in &a.outputs {
                let (Some(dest), Some(d)) = (&o.dest, o.digest_value()) else {
                    continue;
                };
                let dest = a.resolve(dest);
                self.store.copy_to(d, &dest, o.maxlen)?;
                fsutil::set_executable(&dest, o.executable)?;
            }
        }
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_path(&self, key: &Digest) -> PathBuf {
        let (dir, _) = key.as_str().split_at(2);
        self.records_dir.join(dir).join(format!("{}.json", key))
    }

    fn load(&self, key: &Digest) -> Option<CacheFingerprint> {
        let path = self.record_path(key);
        if !path.is_file() {
            return None;
        }
        match fsutil::read_json_with_deserialize(&path) {
            Ok(fp) => Some(fp),
            Err(e) => {
                log::warn!("Dropping unreadable cache record: {}", e);
                self.evict(key);
                None
            }
        }
    }

    fn evict(&self, key: &Digest) {
        if let Err(e) = fsutil::remove_file_if_exists(self.record_path(key)) {
            log::warn!("Failed to evict cache record {}: {}", key, e);
        }
    }
}

fn holder_values(batch: &[GradingArtifacts]) -> Vec<Option<Digest>> {
    batch
        .iter()
        .flat_map(|a| a.outputs.iter())
        .filter_map(|o| o.digest.as_ref())
        .map(|h| h.value.clone())
        .collect()
}

fn set_holder_values(batch: &mut [GradingArtifacts], values: &[Option<Digest>]) {
    let holders = batch
        .iter_mut()
        .flat_map(|a| a.outputs.iter_mut())
        .filter_map(|o| o.digest.as_mut());
    for (h, v) in holders.zip(values) {
        h.value = v.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::artifacts::{DigestHolder, GradingFileInput, GradingFileOutput};
    use crate::digest::digest_bytes;

    struct Fixture {
        dir: tempfile::TempDir,
        cache: DependencyCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path().join(".storage")).unwrap();
        let cache = DependencyCache::open(dir.path(), store).unwrap();
        Fixture { dir, cache }
    }

    fn cmds() -> Vec<String> {
        vec!["cp a b".to_owned()]
    }

    /// Pretends to be a step that stores `in.txt` uppercased.
    fn fake_step(store: &ContentStore) -> impl FnOnce(&mut [GradingArtifacts]) -> Result<bool> + '_ {
        move |batch| {
            let a = &mut batch[0];
            let src = a.resolve("in.txt");
            let upper = fsutil::read_to_string(src)?.to_uppercase();
            let d = store.put_bytes(upper)?;
            a.outputs[0].digest.as_mut().unwrap().value = Some(d);
            Ok(true)
        }
    }

    fn batch(root: &Path) -> GradingArtifacts {
        GradingArtifacts::new(root)
            .input(GradingFileInput::from_path("in.txt", "a"))
            .output(GradingFileOutput::to_digest("b", "out"))
    }

    #[test]
    fn hit_after_store_and_miss_after_input_change() {
        let f = fixture();
        let root = f.dir.path();
        fsutil::write(root.join("in.txt"), "abc").unwrap();
        let extra = serde_json::json!({});

        let mut a = [batch(root)];
        let ok = f
            .cache
            .memoize(&cmds(), &extra, &mut a, fake_step(f.cache.store()))
            .unwrap();
        assert!(ok);
        assert_eq!(a[0].produced("out"), Some(&digest_bytes("ABC")));

        // Fresh declaration, same inputs: answered from cache.
        let mut b = [batch(root)];
        let key = cache_key(&cmds(), &b, &extra).unwrap();
        assert!(f.cache.find_in_cache(&key, &mut b).unwrap());
        assert!(b[0].cached);
        assert_eq!(b[0].produced("out"), Some(&digest_bytes("ABC")));

        fsutil::write(root.join("in.txt"), "xyz").unwrap();
        let mut c = [batch(root)];
        assert!(!f.cache.find_in_cache(&key, &mut c).unwrap());
        assert_eq!(c[0].produced("out"), None);
        // The stale record was evicted.
        assert!(!f.cache.record_path(&key).exists());

        let ok = f
            .cache
            .memoize(&cmds(), &extra, &mut c, fake_step(f.cache.store()))
            .unwrap();
        assert!(ok);
        assert_eq!(c[0].produced("out"), Some(&digest_bytes("XYZ")));
    }

    #[test]
    fn missing_blob_rolls_back_holders() {
        let f = fixture();
        let root = f.dir.path();
        fsutil::write(root.join("in.txt"), "abc").unwrap();
        let extra = serde_json::json!({});

        let mut a = [batch(root)];
        f.cache
            .memoize(&cmds(), &extra, &mut a, fake_step(f.cache.store()))
            .unwrap();
        let blob = f.cache.store().path_of(&digest_bytes("ABC"));
        fsutil::remove_file(blob).unwrap();

        let mut b = [batch(root)];
        let prior = digest_bytes("prior");
        b[0].outputs[0].digest.as_mut().unwrap().value = Some(prior.clone());
        let key = cache_key(&cmds(), &b, &extra).unwrap();
        assert!(!f.cache.find_in_cache(&key, &mut b).unwrap());
        assert_eq!(b[0].produced("out"), Some(&prior));
    }

    #[test]
    fn failed_step_is_not_recorded() {
        let f = fixture();
        let root = f.dir.path();
        fsutil::write(root.join("in.txt"), "abc").unwrap();
        let extra = serde_json::json!({});

        let mut a = [batch(root)];
        let ok = f.cache.memoize(&cmds(), &extra, &mut a, |_| Ok(false)).unwrap();
        assert!(!ok);
        let key = cache_key(&cmds(), &a, &extra).unwrap();
        assert!(!f.cache.record_path(&key).exists());
    }

    #[test]
    fn key_ignores_contents_but_not_shape() {
        let root = Path::new("/r");
        let extra = serde_json::json!({"time_limit_ms": 1000});
        let mut a = [batch(root)];
        let k1 = cache_key(&cmds(), &a, &extra).unwrap();
        a[0].outputs[0].digest.as_mut().unwrap().value = Some(digest_bytes("x"));
        assert_eq!(cache_key(&cmds(), &a, &extra).unwrap(), k1);

        let b = [batch(root).output(GradingFileOutput::to_path("c", "c.txt"))];
        assert_ne!(cache_key(&cmds(), &b, &extra).unwrap(), k1);
        let other = serde_json::json!({"time_limit_ms": 2000});
        assert_ne!(cache_key(&cmds(), &a, &other).unwrap(), k1);
    }

    #[test]
    fn contract_violations() {
        let consumed = GradingArtifacts::new("/r")
            .input(GradingFileInput::from_digest(DigestHolder::new("exe"), "prog"));
        let err = check_digests(&[consumed.clone()]).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(matches!(err, CacheError::ConsumedBeforeProduced(n) if n == "exe"));

        let producer =
            GradingArtifacts::new("/r").output(GradingFileOutput::to_digest("a.out", "exe"));
        check_digests(&[producer.clone(), consumed]).unwrap();

        let twice = producer
            .clone()
            .output(GradingFileOutput::to_digest("b.out", "exe"));
        assert!(matches!(
            check_digests(&[twice]),
            Err(CacheError::ProducedTwice(n)) if n == "exe"
        ));

        let f = fixture();
        let mut bad = [GradingArtifacts::new(f.dir.path())
            .input(GradingFileInput::from_digest(DigestHolder::new("exe"), "prog"))];
        let err = f
            .cache
            .memoize(&cmds(), &serde_json::json!({}), &mut bad, |_| Ok(true))
            .unwrap_err();
        assert!(err.downcast_ref::<CacheError>().unwrap().is_contract_violation());
    }
}
