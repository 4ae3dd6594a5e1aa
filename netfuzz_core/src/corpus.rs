use crate::config::CorpusFormat;
use crate::payload::Payload;
use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::error::{DecodeError, EncodeError};
use log::{debug, info, warn};
use rand::Rng;
use rand_core::RngCore;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of every corpus blob written by [`CorpusStore::add`].
pub const CORPUS_FILE_EXTENSION: &str = "corpus";

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// Sampling was requested from a store without entries.
    #[error("Corpus is empty, cannot select an entry")]
    CorpusIsEmpty,

    /// An I/O error occurred while reading or writing a corpus file.
    #[error("Corpus I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A payload could not be encoded for persisting.
    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    /// A corpus file could not be decoded into a payload.
    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),

    /// The configured inputs path exists but is not a directory.
    #[error("Corpus path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),

    /// An entry backed by this path is already registered or already on disk.
    #[error("Corpus entry {0:?} already exists")]
    DuplicateEntry(PathBuf),

    /// The seed would not name a visible file directly inside the inputs
    /// directory, so peers could never pick it up.
    #[error("Invalid corpus seed {0:?}")]
    InvalidSeed(String),
}

impl CorpusError {
    fn io(path: &Path, source: io::Error) -> Self {
        CorpusError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this failure is expected while a sibling process is still
    /// writing the file. Transient failures are skipped by the loaders,
    /// anything else is surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            CorpusError::Deserialization(_) => true,
            CorpusError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

impl From<EncodeError> for CorpusError {
    fn from(err: EncodeError) -> Self {
        CorpusError::Serialization(format!("Bincode encoding error: {}", err))
    }
}

impl From<DecodeError> for CorpusError {
    fn from(err: DecodeError) -> Self {
        CorpusError::Deserialization(format!("Bincode decoding error: {}", err))
    }
}

/// How an entry came to be registered in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Present in the inputs directory when the store was first loaded.
    Seed,
    /// Discovered and written by this process.
    Local,
    /// Written by a sibling process and picked up through synchronization.
    External,
}

/// Counters accumulated while an entry takes part in further fuzzing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStats {
    /// Number of new corpus entries derived from this one.
    pub new: u64,
    /// Number of crashes observed while fuzzing this entry.
    pub crashes: u64,
}

/// One recorded fuzzing input together with the file that backs it.
#[derive(Debug, Clone)]
pub struct CorpusEntry<P: Payload> {
    origin_path: PathBuf,
    payload: P,
    is_external: bool,
    processed: bool,
    pub stats: EntryStats,
}

impl<P: Payload> CorpusEntry<P> {
    /// External entries start unprocessed: the fuzzing loop has to send them
    /// once before they are treated like any other entry.
    pub fn new(origin_path: PathBuf, payload: P, origin: EntryOrigin) -> Self {
        let is_external = origin == EntryOrigin::External;
        Self {
            origin_path,
            payload,
            is_external,
            processed: !is_external,
            stats: EntryStats::default(),
        }
    }

    pub fn origin_path(&self) -> &Path {
        &self.origin_path
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn is_external(&self) -> bool {
        self.is_external
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn mark_processed(&mut self) {
        self.processed = true;
    }

    pub fn record_new(&mut self) {
        self.stats.new += 1;
    }

    pub fn record_crash(&mut self) {
        self.stats.crashes += 1;
    }
}

/// Turns payloads into corpus blobs and back, and builds the entry for a
/// freshly loaded blob.
///
/// The store is handed one factory at construction time; which one is
/// chosen by [`CorpusFormat`] in the configuration.
pub trait EntryFactory<P: Payload>: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, payload: &P) -> Result<Vec<u8>, CorpusError>;

    fn decode(&self, bytes: &[u8]) -> Result<P, CorpusError>;

    fn create(&self, origin_path: PathBuf, payload: P, origin: EntryOrigin) -> CorpusEntry<P> {
        CorpusEntry::new(origin_path, payload, origin)
    }
}

/// Stores payloads with a fixed little-endian bincode layout.
#[derive(Clone, Copy)]
pub struct BincodeEntryFactory {
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl BincodeEntryFactory {
    pub fn new() -> Self {
        Self {
            bincode_config: bincode::config::standard()
                .with_little_endian()
                .with_fixed_int_encoding(),
        }
    }
}

impl Default for BincodeEntryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Payload> EntryFactory<P> for BincodeEntryFactory {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode(&self, payload: &P) -> Result<Vec<u8>, CorpusError> {
        Ok(bincode::encode_to_vec(payload, self.bincode_config)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<P, CorpusError> {
        if bytes.is_empty() {
            return Err(CorpusError::Deserialization(
                "corpus file is empty".to_string(),
            ));
        }
        let (payload, consumed): (P, usize) =
            bincode::decode_from_slice(bytes, self.bincode_config)?;
        if consumed != bytes.len() {
            return Err(CorpusError::Deserialization(format!(
                "{} trailing bytes after payload",
                bytes.len() - consumed
            )));
        }
        Ok(payload)
    }
}

/// Stores payloads as JSON documents, handy when corpus files are edited by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEntryFactory;

impl<P: Payload> EntryFactory<P> for JsonEntryFactory {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, payload: &P) -> Result<Vec<u8>, CorpusError> {
        serde_json::to_vec_pretty(payload)
            .map_err(|e| CorpusError::Serialization(format!("JSON encoding error: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<P, CorpusError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CorpusError::Deserialization(format!("JSON decoding error: {}", e)))
    }
}

pub fn entry_factory<P: Payload>(format: CorpusFormat) -> Box<dyn EntryFactory<P>> {
    match format {
        CorpusFormat::Bincode => Box::new(BincodeEntryFactory::new()),
        CorpusFormat::Json => Box::new(JsonEntryFactory),
    }
}

/// Result of trying to register a single corpus file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// The path is already registered, most likely because this process wrote it.
    AlreadyKnown,
    /// The file could not be read or decoded yet; a later event may retry it.
    Skipped,
    NotAFile,
}

/// The in-memory ledger of every corpus entry known to this process.
///
/// Each entry is backed by exactly one blob in the inputs directory and is
/// keyed by that blob's path. Entries are only ever appended.
pub struct CorpusStore<P: Payload> {
    directory: PathBuf,
    entries: Vec<CorpusEntry<P>>,
    known_paths: HashSet<PathBuf>,
    factory: Box<dyn EntryFactory<P>>,
}

impl<P: Payload> CorpusStore<P> {
    /// Opens a store over `directory`, creating the directory when missing.
    ///
    /// The directory is canonicalized so that paths reported by filesystem
    /// watches compare equal to the paths this store writes.
    pub fn open(
        directory: impl Into<PathBuf>,
        factory: Box<dyn EntryFactory<P>>,
    ) -> Result<Self, CorpusError> {
        let directory = directory.into();
        if !directory.exists() {
            fs::create_dir_all(&directory).map_err(|e| CorpusError::io(&directory, e))?;
        } else if !directory.is_dir() {
            return Err(CorpusError::NotADirectory(directory));
        }
        let directory = fs::canonicalize(&directory).map_err(|e| CorpusError::io(&directory, e))?;
        debug!("Opened corpus store at {:?} using {}", directory, factory.name());

        Ok(Self {
            directory,
            entries: Vec::new(),
            known_paths: HashSet::new(),
            factory,
        })
    }

    /// The canonical inputs directory shared with peers.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the blob backing the entry named `seed`.
    pub fn corpus_file_path(&self, seed: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", seed, CORPUS_FILE_EXTENSION))
    }

    /// Loads every file already present in this store's own directory.
    pub fn initial_load(&mut self) -> Result<usize, CorpusError> {
        let directory = self.directory.clone();
        self.load_all(&directory)
    }

    /// Registers every regular file in `directory` as a seed entry, in the
    /// order the filesystem lists them.
    ///
    /// Files that fail to decode are logged and skipped; the remaining files
    /// still load. Returns the number of entries added.
    pub fn load_all(&mut self, directory: &Path) -> Result<usize, CorpusError> {
        let mut loaded_count = 0;
        for dir_entry in fs::read_dir(directory).map_err(|e| CorpusError::io(directory, e))? {
            let dir_entry = dir_entry.map_err(|e| CorpusError::io(directory, e))?;
            let path = dir_entry.path();
            if is_hidden(&path) {
                continue;
            }
            match self.load_file(&path, EntryOrigin::Seed)? {
                LoadOutcome::Loaded => loaded_count += 1,
                LoadOutcome::Skipped => warn!("Skipping unreadable corpus file {:?}", path),
                LoadOutcome::AlreadyKnown | LoadOutcome::NotAFile => {}
            }
        }
        info!("Input corpus files loaded: {}", loaded_count);
        Ok(loaded_count)
    }

    /// Reads one corpus file and registers it with the given origin.
    ///
    /// Transient failures (see [`CorpusError::is_transient`]) yield
    /// [`LoadOutcome::Skipped`]; all other failures are returned.
    pub fn load_file(
        &mut self,
        path: &Path,
        origin: EntryOrigin,
    ) -> Result<LoadOutcome, CorpusError> {
        let path = self.normalize(path);
        if self.known_paths.contains(&path) {
            debug!("Corpus added by us, ignore: {:?}", path);
            return Ok(LoadOutcome::AlreadyKnown);
        }
        if !path.is_file() {
            debug!("Not a corpus file, ignore: {:?}", path);
            return Ok(LoadOutcome::NotAFile);
        }

        let payload = match fs::read(&path)
            .map_err(|e| CorpusError::io(&path, e))
            .and_then(|bytes| self.factory.decode(&bytes))
        {
            Ok(payload) => payload,
            Err(e) if e.is_transient() => {
                debug!("Ignoring corpus file {:?} for now: {}", path, e);
                return Ok(LoadOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if origin == EntryOrigin::External {
            info!("Load external corpus: {:?}", path);
        } else {
            debug!("Load corpus file: {:?}", path);
        }
        let entry = self.factory.create(path, payload, origin);
        self.register(entry);
        Ok(LoadOutcome::Loaded)
    }

    /// Persists `payload` as `<directory>/<seed>.corpus` and registers it as
    /// a local entry.
    ///
    /// The blob is written to a hidden temporary file and linked into place
    /// only once complete, so watchers never see a partial file under its
    /// final name. Nothing is registered unless that succeeded.
    ///
    /// # Arguments
    /// * `payload`: The input to persist. The store takes ownership.
    /// * `seed`: Opaque, unique name of the entry. It must not be empty, start
    ///   with `.` (hidden files are staging files to every loader) or contain
    ///   a path separator.
    ///
    /// # Returns
    /// The registered entry, or a `CorpusError` if the seed is invalid or
    /// already taken, or the blob could not be written.
    pub fn add(&mut self, payload: P, seed: &str) -> Result<&CorpusEntry<P>, CorpusError> {
        info!("CorpusStore: add: {}", seed);
        if seed.is_empty() || seed.starts_with('.') || seed.chars().any(std::path::is_separator) {
            return Err(CorpusError::InvalidSeed(seed.to_string()));
        }
        let path = self.corpus_file_path(seed);
        if self.known_paths.contains(&path) {
            return Err(CorpusError::DuplicateEntry(path));
        }

        let bytes = self.factory.encode(&payload)?;
        let mut staged = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.directory)
            .map_err(|e| CorpusError::io(&self.directory, e))?;
        staged
            .write_all(&bytes)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| CorpusError::io(staged.path(), e))?;
        staged.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                CorpusError::DuplicateEntry(path.clone())
            } else {
                CorpusError::io(&path, e.error)
            }
        })?;

        let entry = self.factory.create(path, payload, EntryOrigin::Local);
        Ok(self.register(entry))
    }

    /// Picks the index of a uniformly random entry.
    pub fn sample_id(&self, rng: &mut dyn RngCore) -> Result<usize, CorpusError> {
        if self.entries.is_empty() {
            return Err(CorpusError::CorpusIsEmpty);
        }
        Ok(rng.random_range(0..self.entries.len()))
    }

    /// Returns a uniformly random entry.
    pub fn sample(&self, rng: &mut dyn RngCore) -> Result<&CorpusEntry<P>, CorpusError> {
        let id = self.sample_id(rng)?;
        Ok(&self.entries[id])
    }

    /// Retrieves an entry by its index in registration order.
    ///
    /// # Arguments
    /// * `id`: Index as returned by [`CorpusStore::sample_id`].
    ///
    /// # Returns
    /// The entry, or `None` if no entry has that index.
    pub fn get(&self, id: usize) -> Option<&CorpusEntry<P>> {
        self.entries.get(id)
    }

    /// Mutable counterpart of [`CorpusStore::get`], used to update an entry's stats.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut CorpusEntry<P>> {
        self.entries.get_mut(id)
    }

    /// Returns the number of registered entries.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CorpusEntry<P>> {
        self.entries.iter()
    }

    /// Checks whether an entry backed by `path` is registered.
    ///
    /// Relative and absolute spellings of the same file compare equal, so a
    /// path reported by a directory watch matches the one [`CorpusStore::add`]
    /// wrote.
    pub fn find_by_path(&self, path: &Path) -> bool {
        self.known_paths.contains(&self.normalize(path))
    }

    /// First external entry, in registration order, that has not been
    /// processed yet.
    pub fn pending_external(&self) -> Option<&CorpusEntry<P>> {
        self.entries
            .iter()
            .find(|entry| entry.is_external && !entry.processed)
    }

    pub fn has_pending_external(&self) -> bool {
        self.pending_external().is_some()
    }

    /// Marks the entry backed by `path` as processed. Returns `false` when no
    /// such entry exists.
    pub fn mark_processed(&mut self, path: &Path) -> bool {
        let path = self.normalize(path);
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.origin_path == path)
        {
            Some(entry) => {
                entry.mark_processed();
                true
            }
            None => false,
        }
    }

    /// Logs one line with the stats of every entry.
    pub fn log_stats(&self) {
        for (idx, entry) in self.entries.iter().enumerate() {
            info!(
                "  Corpus {}: Children: {}  Crashes: {}",
                idx, entry.stats.new, entry.stats.crashes
            );
        }
    }

    fn register(&mut self, entry: CorpusEntry<P>) -> &CorpusEntry<P> {
        self.known_paths.insert(entry.origin_path.clone());
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Resolves the parent directory so relative and symlinked spellings of a
    /// corpus path map to the same key.
    fn normalize(&self, path: &Path) -> PathBuf {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => {
                let parent = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
                fs::canonicalize(parent)
                    .map(|p| p.join(name))
                    .unwrap_or_else(|_| path.to_path_buf())
            }
            _ => path.to_path_buf(),
        }
    }
}

pub(crate) fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}
