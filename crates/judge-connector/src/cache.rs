//! Local problem-data cache kept coherent with the dispatcher's object
//! store through per-file version tags.
//!
//! Layout: `<cache_dir>/<host>/<domain>/<pid>/` holds the data files, an
//! `etags` manifest (name -> version tag, JSON) and a `lastUsage` stamp
//! read by an external eviction sweeper. The manifest is the source of
//! truth and is only replaced after every changed file is on disk.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use judge_protocol::DataFile;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use crate::error::JudgeError;
use crate::normalize;

const MANIFEST: &str = "etags";
const MANIFEST_TMP: &str = "etags.tmp";
const LAST_USAGE: &str = "lastUsage";

pub type Manifest = BTreeMap<String, String>;

/// Remote object store holding the problem data.
pub trait DataSource: Send + Sync {
    /// Signed download locations for `files` of problem `pid`.
    fn signed_links<'a>(
        &'a self,
        domain: &'a str,
        pid: &'a str,
        files: &'a [String],
    ) -> BoxFuture<'a, anyhow::Result<HashMap<String, String>>>;

    /// Stream `url` into `dest`, returning the number of bytes written.
    fn download<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, anyhow::Result<u64>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host: String,
    pub domain: String,
    pub pid: String,
}

impl CacheKey {
    pub fn new(host: impl Into<String>, domain: impl Into<String>, pid: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            domain: domain.into(),
            pid: pid.into(),
        }
    }
}

/// Coherent view of a problem directory. The directory is not refreshed
/// while this value is alive.
pub struct ProblemData {
    pub dir: PathBuf,
    /// Where the test data actually starts (see [`normalize::data_root`]).
    pub root: PathBuf,
    _lease: OwnedRwLockReadGuard<()>,
}

/// What a refresh must do to bring a directory up to date. Paths are
/// where each file lives on disk, which after normalization may differ
/// from its remote name.
#[derive(Debug, Default, PartialEq, Eq)]
struct SyncPlan {
    /// Remote name and download destination.
    stale: Vec<(String, PathBuf)>,
    /// Remote name and current location, if still on disk.
    obsolete: Vec<(String, Option<PathBuf>)>,
    manifest: Manifest,
}

impl SyncPlan {
    fn compute(dir: &Path, files: &[DataFile]) -> Self {
        let current = load_manifest(dir);
        let manifest: Manifest = files
            .iter()
            .map(|f| (f.name.clone(), f.version_tag()))
            .collect();
        let stale = manifest
            .iter()
            .filter_map(|(name, tag)| {
                let local = locate(dir, name, &manifest).filter(|p| p.is_file());
                match local {
                    Some(_) if current.get(name) == Some(tag) => None,
                    // Overwrite the existing copy in place.
                    Some(path) => Some((name.clone(), path)),
                    None => Some((name.clone(), dir.join(name))),
                }
            })
            .collect();
        let obsolete = current
            .keys()
            .filter(|name| !manifest.contains_key(*name))
            .map(|name| (name.clone(), locate(dir, name, &manifest)))
            .collect();
        Self {
            stale,
            obsolete,
            manifest,
        }
    }

    fn is_current(&self) -> bool {
        self.stale.is_empty() && self.obsolete.is_empty()
    }

    async fn load(dir: &Path, files: &[DataFile]) -> Result<Self, JudgeError> {
        let dir = dir.to_path_buf();
        let files = files.to_vec();
        blocking(move || Self::compute(&dir, &files)).await
    }
}

/// On-disk location of `name`, unless the normalized spelling it maps
/// to belongs to another file in `claimed`.
fn locate(dir: &Path, name: &str, claimed: &Manifest) -> Option<PathBuf> {
    let path = normalize::resolve(dir, name)?;
    let other = path != dir.join(name)
        && path
            .strip_prefix(dir)
            .ok()
            .and_then(|rel| rel.to_str())
            .is_some_and(|rel| claimed.contains_key(rel));
    (!other).then_some(path)
}

pub struct DataCache {
    root: PathBuf,
    locks: Mutex<HashMap<CacheKey, Arc<RwLock<()>>>>,
}

impl DataCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir_for(&self, key: &CacheKey) -> Result<PathBuf, JudgeError> {
        for part in [&key.host, &key.domain, &key.pid] {
            validate_component(part)?;
        }
        Ok(self.root.join(&key.host).join(&key.domain).join(&key.pid))
    }

    /// Per-key lock. Entries nobody holds any more are dropped, so the
    /// map only tracks problems currently in use.
    fn lock_for(&self, key: &CacheKey) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Make the local copy of `key` match `files` and return a lease on it.
    /// `on_sync` fires once, right before any download starts.
    pub async fn acquire(
        &self,
        source: &dyn DataSource,
        key: &CacheKey,
        files: &[DataFile],
        on_sync: impl FnOnce() + Send,
    ) -> Result<ProblemData, JudgeError> {
        if files.is_empty() {
            return Err(JudgeError::system("Problem data not found."));
        }
        for file in files {
            validate_file_name(&file.name)?;
        }
        let dir = self.dir_for(key)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            JudgeError::system(format!("failed to create cache dir {}: {e}", dir.display()))
        })?;

        let lock = self.lock_for(key);
        let mut lease = Arc::clone(&lock).read_owned().await;
        if !SyncPlan::load(&dir, files).await?.is_current() {
            drop(lease);
            let write = Arc::clone(&lock).write_owned().await;
            // Another task may have refreshed while we queued for the lock.
            let plan = SyncPlan::load(&dir, files).await?;
            if !plan.is_current() {
                refresh(source, key, &dir, plan, on_sync).await?;
            }
            lease = write.downgrade();
        }

        let root = {
            let dir = dir.clone();
            blocking(move || {
                touch_last_usage(&dir);
                normalize::data_root(&dir)
            })
            .await?
        };
        Ok(ProblemData {
            dir,
            root,
            _lease: lease,
        })
    }
}

async fn refresh(
    source: &dyn DataSource,
    key: &CacheKey,
    dir: &Path,
    plan: SyncPlan,
    on_sync: impl FnOnce() + Send,
) -> Result<(), JudgeError> {
    for (name, local) in &plan.obsolete {
        let Some(path) = local else { continue };
        let removed = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            _ => tokio::fs::remove_file(path).await,
        };
        match removed {
            Ok(()) => debug!(file = %name, path = %path.display(), "removed obsolete data file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %path.display(), "failed to remove obsolete data file: {e}"),
        }
    }

    if !plan.stale.is_empty() {
        info!(
            host = %key.host,
            domain = %key.domain,
            pid = %key.pid,
            files = plan.stale.len(),
            "syncing problem data"
        );
        on_sync();
        let names: Vec<String> = plan.stale.iter().map(|(name, _)| name.clone()).collect();
        let links = source.signed_links(&key.domain, &key.pid, &names).await?;
        for (name, dest) in &plan.stale {
            let url = links.get(name).ok_or_else(|| {
                JudgeError::system_with("No download link for {0}", vec![name.clone()])
            })?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = source.download(url, dest).await?;
            debug!(file = %name, bytes, "downloaded data file");
        }
    }

    write_manifest(dir, &plan.manifest).await?;
    let owned = dir.to_path_buf();
    if let Err(e) = blocking(move || normalize::normalize(&owned)).await? {
        warn!(dir = %dir.display(), "test data normalization failed: {e}");
    }
    Ok(())
}

/// Directory walks and small metadata reads stay off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, JudgeError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| JudgeError::system(format!("cache worker failed: {e}")))
}

/// Read the manifest; a missing or unreadable one counts as empty.
pub fn load_manifest(dir: &Path) -> Manifest {
    let path = dir.join(MANIFEST);
    let Ok(data) = std::fs::read_to_string(&path) else {
        return Manifest::new();
    };
    serde_json::from_str(&data).unwrap_or_else(|e| {
        warn!(path = %path.display(), "ignoring corrupt manifest: {e}");
        Manifest::new()
    })
}

async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), JudgeError> {
    let data = serde_json::to_vec(manifest)
        .map_err(|e| JudgeError::system(format!("failed to encode manifest: {e}")))?;
    let tmp = dir.join(MANIFEST_TMP);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, dir.join(MANIFEST)).await?;
    Ok(())
}

fn touch_last_usage(dir: &Path) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    if let Err(e) = std::fs::write(dir.join(LAST_USAGE), now.to_string()) {
        warn!(dir = %dir.display(), "failed to stamp last usage: {e}");
    }
}

fn validate_component(part: &str) -> Result<(), JudgeError> {
    if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\', '\0']) {
        return Err(JudgeError::system_with(
            "Invalid cache path component {0}",
            vec![part.to_string()],
        ));
    }
    Ok(())
}

fn validate_file_name(name: &str) -> Result<(), JudgeError> {
    let path = Path::new(name);
    let plain = !name.is_empty()
        && !name.contains('\0')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        && !normalize::BOOKKEEPING.contains(&name);
    if !plain {
        return Err(JudgeError::system_with(
            "Invalid data file name {0}",
            vec![name.to_string()],
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory object store that records what was fetched.
    #[derive(Default)]
    pub struct MemorySource {
        pub files: Mutex<HashMap<String, Vec<u8>>>,
        pub downloads: Mutex<Vec<String>>,
        pub link_requests: AtomicUsize,
        /// Download delay, to widen race windows in concurrency tests.
        pub delay: Option<std::time::Duration>,
    }

    impl MemorySource {
        pub fn with_files(files: &[(&str, &str)]) -> Self {
            let source = Self::default();
            source.put_all(files);
            source
        }

        pub fn put_all(&self, files: &[(&str, &str)]) {
            let mut map = self.files.lock().unwrap();
            for (name, body) in files {
                map.insert(name.to_string(), body.as_bytes().to_vec());
            }
        }

        pub fn downloaded(&self) -> Vec<String> {
            let mut names = self.downloads.lock().unwrap().clone();
            names.sort();
            names
        }

        pub fn link_requests(&self) -> usize {
            self.link_requests.load(Ordering::SeqCst)
        }
    }

    impl DataSource for MemorySource {
        fn signed_links<'a>(
            &'a self,
            _domain: &'a str,
            _pid: &'a str,
            files: &'a [String],
        ) -> BoxFuture<'a, anyhow::Result<HashMap<String, String>>> {
            Box::pin(async move {
                self.link_requests.fetch_add(1, Ordering::SeqCst);
                Ok(files
                    .iter()
                    .map(|name| (name.clone(), format!("mem://{name}")))
                    .collect())
            })
        }

        fn download<'a>(
            &'a self,
            url: &'a str,
            dest: &'a Path,
        ) -> BoxFuture<'a, anyhow::Result<u64>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                let name = url.trim_start_matches("mem://").to_string();
                let body = self
                    .files
                    .lock()
                    .unwrap()
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("no such object: {name}"))?;
                tokio::fs::write(dest, &body).await?;
                self.downloads.lock().unwrap().push(name);
                Ok(body.len() as u64)
            })
        }
    }

    pub fn data_file(name: &str, etag: &str) -> DataFile {
        DataFile {
            name: name.to_string(),
            etag: etag.to_string(),
            last_modified: String::new(),
            size: None,
        }
    }
}
