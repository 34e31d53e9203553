
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{FlatIndex, Metric};
use crate::corpus::Corpus;
use crate::embeddings::{ContextEncoder, EncoderSettings};
use crate::{RagError, Result};

const MAGIC: &[u8; 8] = b"KBRAGIDX";
const FORMAT_VERSION: u32 = 1;
// magic + version + metric tag + dimension + row count
const HEADER_LEN: usize = 8 + 4 + 1 + 4 + 8;

const MANIFEST_SUFFIX: &str = ".manifest.json";
const LOCK_SUFFIX: &str = ".lock";
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);
const LOCK_HEARTBEAT: Duration = Duration::from_secs(60);

impl FlatIndex {
    /// Write the index to `path` atomically (temp file in the same directory,
    /// then rename), creating parent directories as needed.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.raw_vectors().len() * 4);

        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.push(self.metric().tag());
        bytes.extend_from_slice(&dimension_to_u32(self.dimension())?.to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for value in self.raw_vectors() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        write_atomically(path, &bytes)?;
        debug!(
            "Saved index with {} rows of {} dimensions to {}",
            self.len(),
            self.dimension(),
            path.display()
        );
        Ok(())
    }

    /// Read an index written by [`FlatIndex::save`]. A missing file is not an
    /// error: it yields `Ok(None)` so the caller can rebuild.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |what: &str| RagError::Index(format!("{}: {what}", path.display()));

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("file is truncated"));
        }
        if &bytes[..8] != MAGIC {
            return Err(corrupt("not an index file"));
        }

        let version = u32::from_le_bytes(read_array(&bytes, 8));
        if version != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported format version {version}")));
        }

        let metric =
            Metric::from_tag(bytes[12]).ok_or_else(|| corrupt("unknown metric tag"))?;
        let dimension = u32::from_le_bytes(read_array(&bytes, 13)) as usize;
        let rows = u64::from_le_bytes(read_array(&bytes, 17));

        if dimension == 0 || rows == 0 {
            return Err(corrupt("index is empty"));
        }

        let expected = usize::try_from(rows)
            .ok()
            .and_then(|rows| rows.checked_mul(dimension))
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| corrupt("row count overflows"))?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != expected {
            return Err(corrupt(&format!(
                "expected {expected} bytes of vectors, found {}",
                payload.len()
            )));
        }

        let vectors = payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Some(Self::from_parts(metric, dimension, vectors)))
    }
}

/// Build stamp written next to the index file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub format_version: u32,
    pub corpus_fingerprint: String,
    pub paragraph_count: usize,
    pub dimension: usize,
    pub metric: Metric,
    pub context_encoder: String,
    pub context_prefix: String,
    pub max_context_tokens: usize,
    pub built_at: DateTime<Utc>,
}

impl IndexManifest {
    #[inline]
    pub fn new(corpus: &Corpus, index: &FlatIndex, encoder: &EncoderSettings) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            corpus_fingerprint: corpus.fingerprint().to_string(),
            paragraph_count: corpus.len(),
            dimension: index.dimension(),
            metric: index.metric(),
            context_encoder: encoder.model.clone(),
            context_prefix: encoder.prefix.clone(),
            max_context_tokens: encoder.max_tokens,
            built_at: Utc::now(),
        }
    }

    #[inline]
    pub fn path_for(index_path: &Path) -> PathBuf {
        with_suffix(index_path, MANIFEST_SUFFIX)
    }

    pub fn load(index_path: &Path) -> Result<Option<Self>> {
        let path = Self::path_for(index_path);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&content) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!("Ignoring unreadable index manifest {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn save(&self, index_path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| RagError::Index(format!("failed to serialize manifest: {e}")))?;
        write_atomically(&Self::path_for(index_path), &json)
    }

    /// Reason this manifest does not describe an index for `corpus`, if any
    pub fn mismatch(
        &self,
        corpus: &Corpus,
        metric: Metric,
        encoder: &EncoderSettings,
    ) -> Option<String> {
        if self.format_version != FORMAT_VERSION {
            Some(format!("format version {} is outdated", self.format_version))
        } else if self.corpus_fingerprint != corpus.fingerprint() {
            Some("knowledge base content changed".to_string())
        } else if self.paragraph_count != corpus.len() {
            Some(format!(
                "paragraph count changed ({} -> {})",
                self.paragraph_count,
                corpus.len()
            ))
        } else if self.metric != metric {
            Some(format!("metric changed ({} -> {})", self.metric, metric))
        } else if self.context_encoder != encoder.model {
            Some(format!(
                "context encoder changed ({} -> {})",
                self.context_encoder, encoder.model
            ))
        } else if self.context_prefix != encoder.prefix {
            Some(format!(
                "context prefix changed ({:?} -> {:?})",
                self.context_prefix, encoder.prefix
            ))
        } else if self.max_context_tokens != encoder.max_tokens {
            Some(format!(
                "context token limit changed ({} -> {})",
                self.max_context_tokens, encoder.max_tokens
            ))
        } else {
            None
        }
    }
}

/// Exclusive lock around building and persisting one index file.
///
/// The lock is a sibling file created with `create_new` holding a token unique
/// to this holder. Only the holder whose token is still on disk removes it on
/// drop, so a builder whose lock was broken as stale cannot delete its
/// successor's lock.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    token: String,
}

impl BuildLock {
    #[inline]
    pub fn path_for(index_path: &Path) -> PathBuf {
        with_suffix(index_path, LOCK_SUFFIX)
    }

    /// Acquire the lock for `index_path`, waiting up to `wait` for another
    /// holder. Locks not refreshed for ten minutes are treated as abandoned.
    pub fn acquire(index_path: &Path, wait: Duration) -> Result<Self> {
        let path = Self::path_for(index_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let token = lock_token();
        let started = SystemTime::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())?;
                    file.sync_all()?;
                    debug!("Acquired index build lock {}", path.display());
                    return Ok(Self { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&path).is_some_and(|age| age > STALE_LOCK_AGE) {
                        warn!("Breaking stale index build lock {}", path.display());
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }

                    let waited = started.elapsed().unwrap_or_default();
                    if waited >= wait {
                        return Err(RagError::IndexLocked(path.display().to_string()));
                    }
                    thread::sleep(LOCK_POLL_INTERVAL.min(wait - waited));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether the lock file on disk still carries this holder's token
    pub fn is_held(&self) -> bool {
        fs::read_to_string(&self.path).is_ok_and(|content| content == self.token)
    }

    /// Bump the lock's mtime so waiting builders keep treating it as live.
    /// Fails if another builder has broken and retaken the lock.
    pub fn refresh(&self) -> Result<()> {
        if !self.is_held() {
            return Err(RagError::IndexLocked(format!(
                "{} (taken over by another builder)",
                self.path.display()
            )));
        }
        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .set_modified(SystemTime::now())?;
        Ok(())
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if !self.is_held() {
            warn!(
                "Index build lock {} was taken over, leaving it in place",
                self.path.display()
            );
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove index build lock {}: {}", self.path.display(), e);
        }
    }
}

fn lock_token() -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "pid={} at={} seq={}",
        std::process::id(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// An index ready for querying, with its build stamp
#[derive(Debug, Clone)]
pub struct LoadedIndex {
    pub index: FlatIndex,
    pub manifest: IndexManifest,
    /// True when the corpus was re-encoded in this call
    pub rebuilt: bool,
}

/// Cache policy around a persisted index: reuse it when its manifest matches
/// the current corpus and models, rebuild and persist it otherwise.
#[derive(Debug, Clone)]
pub struct IndexStore {
    index_path: PathBuf,
    lock_wait: Duration,
}

impl IndexStore {
    #[inline]
    pub fn new<P: Into<PathBuf>>(index_path: P) -> Self {
        Self {
            index_path: index_path.into(),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    #[inline]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    #[inline]
    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn load_or_build(
        &self,
        corpus: &Corpus,
        encoder: &ContextEncoder,
        metric: Metric,
    ) -> Result<LoadedIndex> {
        let lock = BuildLock::acquire(&self.index_path, self.lock_wait)?;

        if let Some((index, manifest)) = self.load_matching(corpus, &encoder.settings(), metric)? {
            info!(
                "Loaded index from {} ({} paragraphs, built {})",
                self.index_path.display(),
                index.len(),
                manifest.built_at.format("%Y-%m-%d %H:%M:%S")
            );
            return Ok(LoadedIndex {
                index,
                manifest,
                rebuilt: false,
            });
        }

        self.build_locked(&lock, corpus, encoder, metric)
    }

    /// Re-encode and persist unconditionally
    pub fn rebuild(
        &self,
        corpus: &Corpus,
        encoder: &ContextEncoder,
        metric: Metric,
    ) -> Result<LoadedIndex> {
        let lock = BuildLock::acquire(&self.index_path, self.lock_wait)?;
        self.build_locked(&lock, corpus, encoder, metric)
    }

    fn load_matching(
        &self,
        corpus: &Corpus,
        encoder: &EncoderSettings,
        metric: Metric,
    ) -> Result<Option<(FlatIndex, IndexManifest)>> {
        let Some(manifest) = IndexManifest::load(&self.index_path)? else {
            if self.index_path.exists() {
                warn!(
                    "Index {} has no manifest, rebuilding",
                    self.index_path.display()
                );
            }
            return Ok(None);
        };

        if let Some(reason) = manifest.mismatch(corpus, metric, encoder) {
            warn!("Index {} is stale: {}", self.index_path.display(), reason);
            return Ok(None);
        }

        let index = match FlatIndex::load(&self.index_path) {
            Ok(Some(index)) => index,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Discarding unreadable index: {}", e);
                return Ok(None);
            }
        };

        if index.len() != corpus.len()
            || index.metric() != metric
            || index.dimension() != manifest.dimension
        {
            warn!(
                "Index {} does not agree with its manifest, rebuilding",
                self.index_path.display()
            );
            return Ok(None);
        }

        Ok(Some((index, manifest)))
    }

    fn build_locked(
        &self,
        lock: &BuildLock,
        corpus: &Corpus,
        encoder: &ContextEncoder,
        metric: Metric,
    ) -> Result<LoadedIndex> {
        info!(
            "Encoding {} paragraphs with {} and building {} index",
            corpus.len(),
            encoder.model_name(),
            metric
        );

        let embeddings = thread::scope(|scope| {
            let (done, stop) = mpsc::channel::<()>();
            scope.spawn(move || heartbeat(lock, &stop));
            let encoded = encoder.encode_paragraphs(corpus.paragraphs());
            drop(done);
            encoded
        })?;
        let index = FlatIndex::build(&embeddings, metric)?;
        let manifest = IndexManifest::new(corpus, &index, &encoder.settings());

        // Never overwrite files a newer builder now owns
        lock.refresh()?;

        // Index first: a crash in between leaves an index without a manifest,
        // which is treated as stale.
        index.save(&self.index_path)?;
        manifest.save(&self.index_path)?;

        info!("Index built and saved to {}", self.index_path.display());
        Ok(LoadedIndex {
            index,
            manifest,
            rebuilt: true,
        })
    }
}

/// Keep `lock` fresh until `stop` is dropped
fn heartbeat(lock: &BuildLock, stop: &Receiver<()>) {
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(LOCK_HEARTBEAT) {
        if let Err(e) = lock.refresh() {
            warn!("Stopped refreshing index build lock: {}", e);
            return;
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        writer.write_all(bytes)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

fn dimension_to_u32(dimension: usize) -> Result<u32> {
    u32::try_from(dimension)
        .map_err(|_| RagError::Index(format!("dimension {dimension} is too large to persist")))
}
