//! Crash-consistent key/value store mirrored to a flat file.
//!
//! Every mutation lands in the in-memory map synchronously and is queued for
//! a dedicated writer thread, which applies queued operations in FIFO order
//! and rewrites the file through a temp file + rename. A crash therefore
//! leaves either the previous image or the new one on disk.
//!
//! Lock order is always `memory` then `queue`; the writer thread only ever
//! takes `queue`, so it can never deadlock against a caller.
//!
//! File layout: one record per line, `key TAB payload NEWLINE`, where the
//! payload is the value's tab-delimited text form.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ffi::OsString;
use std::fmt::Display;
use std::fs;
use std::hash::Hash;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::codec::{FIELD_SEPARATOR, RECORD_SEPARATOR};
use crate::error::{AnalyticsError, Result};
use crate::event::AnalyticEvent;
use crate::value::TaggedValue;

/// Values that can be written to a store file.
pub trait Persist {
    /// Append the tab-delimited text form. Must not contain a NEWLINE.
    fn serialize_to(&self, out: &mut String);
}

impl Persist for TaggedValue {
    fn serialize_to(&self, out: &mut String) {
        TaggedValue::serialize_to(self, out)
    }
}

impl Persist for AnalyticEvent {
    fn serialize_to(&self, out: &mut String) {
        AnalyticEvent::serialize_to(self, out)
    }
}

/// Parses one record payload back into a value.
pub type Deserializer<V> = Box<dyn Fn(&str) -> Result<V> + Send + Sync>;

/// What to do with a record that fails to parse on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordPolicy {
    /// Abort the load; the unread records stay on disk.
    #[default]
    Strict,
    /// Log and drop the record, load the rest.
    SkipMalformed,
}

enum WriteOp {
    Store { key: String, record: String },
    Remove { key: String },
    Clear,
    Swap,
}

struct WriteQueue {
    ops: VecDeque<WriteOp>,
    in_flight: bool,
    shutdown: bool,
    exited: bool,
}

struct WriterShared {
    path: PathBuf,
    backup_path: PathBuf,
    queue: Mutex<WriteQueue>,
    work_ready: Condvar,
    drained: Condvar,
}

struct MemoryState<K, V> {
    map: HashMap<K, V>,
    /// Raw lines read at open and not yet parsed by `load`.
    unloaded: Option<Vec<String>>,
}

/// Generic durable key/value store with a background writer.
pub struct DurableStore<K, V> {
    shared: Arc<WriterShared>,
    memory: Mutex<MemoryState<K, V>>,
    deserializer: Deserializer<V>,
    policy: RecordPolicy,
    writer: Option<JoinHandle<()>>,
}

impl<K, V> DurableStore<K, V>
where
    K: Eq + Hash + Clone + Display + FromStr,
    V: Persist + Clone,
{
    /// Open (or create) the store at `path`.
    ///
    /// A `.bak` file left next to `path` by an earlier swap is deleted.
    pub fn open(
        path: impl AsRef<Path>,
        deserializer: impl Fn(&str) -> Result<V> + Send + Sync + 'static,
        policy: RecordPolicy,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backup_path = sibling(&path, ".bak");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
            tracing::info!(path = %backup_path.display(), "removed stale store backup");
        }

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<String> = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let image: BTreeMap<String, String> = lines
            .iter()
            .filter_map(|line| line.split_once(FIELD_SEPARATOR))
            .map(|(key, payload)| (key.to_string(), payload.to_string()))
            .collect();

        tracing::debug!(path = %path.display(), records = lines.len(), "opened durable store");

        let shared = Arc::new(WriterShared {
            path,
            backup_path,
            queue: Mutex::new(WriteQueue {
                ops: VecDeque::new(),
                in_flight: false,
                shutdown: false,
                exited: false,
            }),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
        });

        let thread_name = format!(
            "store-writer:{}",
            shared
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let writer_shared = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_writer(writer_shared, image))?;

        Ok(Self {
            shared,
            memory: Mutex::new(MemoryState {
                map: HashMap::new(),
                unloaded: Some(lines),
            }),
            deserializer: Box::new(deserializer),
            policy,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.shared.backup_path
    }

    /// Number of records in the in-memory view.
    pub fn len(&self) -> usize {
        self.memory.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store(&self, key: K, value: V) -> Result<()> {
        let key_text = key_text(&key)?;
        let mut record = String::new();
        value.serialize_to(&mut record);
        debug_assert!(!record.contains(RECORD_SEPARATOR));

        let mut memory = self.memory.lock();
        forget_unloaded(&mut *memory, &key_text);
        memory.map.insert(key, value);
        self.enqueue(WriteOp::Store {
            key: key_text,
            record,
        })
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        let key_text = key_text(key)?;
        let mut memory = self.memory.lock();
        forget_unloaded(&mut *memory, &key_text);
        memory.map.remove(key);
        self.enqueue(WriteOp::Remove { key: key_text })
    }

    /// Snapshot of the contents. Records on disk are parsed on the first call.
    pub fn load(&self) -> Result<HashMap<K, V>> {
        let mut memory = self.memory.lock();
        self.merge_unloaded(&mut memory)?;
        Ok(memory.map.clone())
    }

    pub fn clear(&self) -> Result<()> {
        let mut memory = self.memory.lock();
        memory.map.clear();
        memory.unloaded = None;
        self.enqueue(WriteOp::Clear)
    }

    /// Move the file aside to `<file>.bak`, empty the store and return what
    /// it held. Returns once the rotation has reached the disk.
    pub fn swap(&self) -> Result<HashMap<K, V>> {
        let contents = {
            let mut memory = self.memory.lock();
            self.merge_unloaded(&mut memory)?;
            let contents = std::mem::take(&mut memory.map);
            self.enqueue(WriteOp::Swap)?;
            contents
        };
        self.synchronize();
        tracing::debug!(
            path = %self.shared.path.display(),
            records = contents.len(),
            "swapped durable store"
        );
        Ok(contents)
    }

    /// Block until every queued write has reached the disk.
    ///
    /// Must not be called while holding a lock that a store mutation needs.
    pub fn synchronize(&self) {
        let mut queue = self.shared.queue.lock();
        while (!queue.ops.is_empty() || queue.in_flight) && !queue.exited {
            self.shared.drained.wait(&mut queue);
        }
    }

    /// Flush pending writes and stop the writer thread.
    pub fn close(mut self) {
        self.shutdown_writer();
    }

    /// Refuse every later mutation, as after shutdown.
    #[cfg(test)]
    pub(crate) fn stop_accepting_writes(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        self.shared.work_ready.notify_all();
    }

    fn enqueue(&self, op: WriteOp) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(AnalyticsError::StoreClosed(
                self.shared.path.display().to_string(),
            ));
        }
        queue.ops.push_back(op);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    fn merge_unloaded(&self, memory: &mut MemoryState<K, V>) -> Result<()> {
        let Some(lines) = memory.unloaded.as_ref() else {
            return Ok(());
        };

        let mut parsed = Vec::with_capacity(lines.len());
        let mut skipped = Vec::new();
        for line in lines {
            match self.parse_line(line) {
                Ok(record) => parsed.push(record),
                Err(e) => match self.policy {
                    RecordPolicy::Strict => {
                        tracing::error!(
                            error = %e,
                            path = %self.shared.path.display(),
                            "malformed store record, load aborted"
                        );
                        return Err(e);
                    }
                    RecordPolicy::SkipMalformed => {
                        tracing::warn!(
                            error = %e,
                            path = %self.shared.path.display(),
                            "skipping malformed store record"
                        );
                        if let Some((key, _)) = line.split_once(FIELD_SEPARATOR) {
                            skipped.push(key.to_string());
                        }
                    }
                },
            }
        }

        memory.unloaded = None;
        for (key, value) in parsed {
            memory.map.entry(key).or_insert(value);
        }
        for key in skipped {
            self.enqueue(WriteOp::Remove { key })?;
        }
        Ok(())
    }

    fn parse_line(&self, line: &str) -> Result<(K, V)> {
        let (key, payload) = line.split_once(FIELD_SEPARATOR).ok_or_else(|| {
            AnalyticsError::Deserialization(format!("record without key separator: {:?}", line))
        })?;
        let key = key
            .parse::<K>()
            .map_err(|_| AnalyticsError::Deserialization(format!("malformed key {:?}", key)))?;
        let value = (self.deserializer)(payload)?;
        Ok((key, value))
    }
}

impl<K, V> DurableStore<K, V> {
    fn shutdown_writer(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        if let Some(handle) = self.writer.take() {
            if handle.join().is_err() {
                tracing::error!(path = %self.shared.path.display(), "store writer panicked");
            }
        }
    }
}

impl<K, V> Drop for DurableStore<K, V> {
    fn drop(&mut self) {
        self.shutdown_writer();
    }
}

impl<K, V> std::fmt::Debug for DurableStore<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("path", &self.shared.path)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn key_text<K: Display>(key: &K) -> Result<String> {
    let text = key.to_string();
    if text.contains(FIELD_SEPARATOR) || text.contains(RECORD_SEPARATOR) {
        return Err(AnalyticsError::InvalidArgument(format!(
            "store key contains a separator: {:?}",
            text
        )));
    }
    Ok(text)
}

fn forget_unloaded<K, V>(memory: &mut MemoryState<K, V>, key_text: &str) {
    if let Some(lines) = memory.unloaded.as_mut() {
        lines.retain(|line| line.split(FIELD_SEPARATOR).next() != Some(key_text));
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn run_writer(shared: Arc<WriterShared>, mut image: BTreeMap<String, String>) {
    loop {
        let batch: Vec<WriteOp> = {
            let mut queue = shared.queue.lock();
            while queue.ops.is_empty() && !queue.shutdown {
                shared.work_ready.wait(&mut queue);
            }
            if queue.ops.is_empty() {
                queue.exited = true;
                shared.drained.notify_all();
                break;
            }
            queue.in_flight = true;
            queue.ops.drain(..).collect()
        };

        apply_batch(&shared, &mut image, batch);

        let mut queue = shared.queue.lock();
        queue.in_flight = false;
        if queue.ops.is_empty() {
            shared.drained.notify_all();
        }
    }
    tracing::debug!(path = %shared.path.display(), "store writer exited");
}

fn apply_batch(shared: &WriterShared, image: &mut BTreeMap<String, String>, batch: Vec<WriteOp>) {
    let mut dirty = false;
    for op in batch {
        match op {
            WriteOp::Store { key, record } => {
                image.insert(key, record);
                dirty = true;
            }
            WriteOp::Remove { key } => {
                dirty |= image.remove(&key).is_some();
            }
            WriteOp::Clear => {
                image.clear();
                dirty = true;
            }
            WriteOp::Swap => {
                if dirty {
                    flush_image(shared, image);
                }
                if let Err(e) = rotate_to_backup(&shared.path, &shared.backup_path) {
                    tracing::error!(
                        error = %e,
                        path = %shared.path.display(),
                        "failed to rotate store to backup"
                    );
                }
                image.clear();
                dirty = true;
            }
        }
    }
    if dirty {
        flush_image(shared, image);
    }
}

fn flush_image(shared: &WriterShared, image: &BTreeMap<String, String>) {
    if let Err(e) = write_image(&shared.path, image) {
        tracing::error!(
            error = %e,
            path = %shared.path.display(),
            "failed to write store file"
        );
    }
}

/// Atomic rewrite: write to a temp file, sync, then rename over `path`.
fn write_image(path: &Path, image: &BTreeMap<String, String>) -> std::io::Result<()> {
    let tmp_path = sibling(path, ".tmp");
    let result = write_records(&tmp_path, image).and_then(|()| fs::rename(&tmp_path, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_records(path: &Path, image: &BTreeMap<String, String>) -> std::io::Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for (key, record) in image {
        writer.write_all(key.as_bytes())?;
        write!(writer, "{}", FIELD_SEPARATOR)?;
        writer.write_all(record.as_bytes())?;
        write!(writer, "{}", RECORD_SEPARATOR)?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

fn rotate_to_backup(path: &Path, backup_path: &Path) -> std::io::Result<()> {
    match fs::remove_file(backup_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    match fs::rename(path, backup_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type ValueStore = DurableStore<String, TaggedValue>;

    fn open_values(path: &Path, policy: RecordPolicy) -> ValueStore {
        DurableStore::open(path, TaggedValue::from_serialized, policy).unwrap()
    }

    #[test]
    fn test_store_is_visible_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_values(&dir.path().join("s"), RecordPolicy::Strict);
        store.store("a".into(), TaggedValue::long(1)).unwrap();
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.get("a"), Some(&TaggedValue::long(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        {
            let store = open_values(&path, RecordPolicy::Strict);
            store.store("a".into(), TaggedValue::string("x")).unwrap();
            store.store("b".into(), TaggedValue::double(2.5)).unwrap();
            store.store("c".into(), TaggedValue::boolean(true)).unwrap();
            store.remove(&"c".to_string()).unwrap();
            store.synchronize();
        }
        let store = open_values(&path, RecordPolicy::Strict);
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["a"], TaggedValue::string("x"));
        assert_eq!(snapshot["b"], TaggedValue::double(2.5));
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("k".into(), TaggedValue::long(3)).unwrap();
        store.synchronize();
        assert_eq!(fs::read_to_string(&path).unwrap(), "k\t1\t0\t3\t\n");
    }

    #[test]
    fn test_drop_flushes_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        {
            let store = open_values(&path, RecordPolicy::Strict);
            for i in 0..50 {
                store.store(format!("k{}", i), TaggedValue::long(i)).unwrap();
            }
        }
        let store = open_values(&path, RecordPolicy::Strict);
        assert_eq!(store.load().unwrap().len(), 50);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("a".into(), TaggedValue::long(1)).unwrap();
        store.clear().unwrap();
        store.synchronize();
        assert!(store.load().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_swap_rotates_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("a".into(), TaggedValue::string("v")).unwrap();
        store.synchronize();

        let swapped = store.swap().unwrap();
        assert_eq!(swapped.get("a"), Some(&TaggedValue::string("v")));
        assert!(store.load().unwrap().is_empty());

        let backup = fs::read_to_string(store.backup_path()).unwrap();
        assert!(backup.starts_with("a\t0\tv\t"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "");

        drop(store);
        let reopened = open_values(&path, RecordPolicy::Strict);
        assert!(!reopened.backup_path().exists());
        assert!(reopened.load().unwrap().is_empty());
    }

    #[test]
    fn test_swap_orders_with_surrounding_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("before".into(), TaggedValue::long(1)).unwrap();
        let swapped = store.swap().unwrap();
        store.store("after".into(), TaggedValue::long(2)).unwrap();
        store.synchronize();

        assert_eq!(swapped.len(), 1);
        let backup = fs::read_to_string(store.backup_path()).unwrap();
        assert!(backup.contains("before"));
        let current = fs::read_to_string(&path).unwrap();
        assert!(current.contains("after"));
        assert!(!current.contains("before"));
    }

    #[test]
    fn test_second_swap_replaces_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_values(&dir.path().join("s"), RecordPolicy::Strict);
        store.store("first".into(), TaggedValue::long(1)).unwrap();
        store.swap().unwrap();
        store.store("second".into(), TaggedValue::long(2)).unwrap();
        store.swap().unwrap();
        let backup = fs::read_to_string(store.backup_path()).unwrap();
        assert!(backup.contains("second"));
        assert!(!backup.contains("first"));
    }

    #[test]
    fn test_writes_before_load_keep_disk_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        fs::write(&path, "old\t1\t0\t1\t\ngone\t1\t0\t2\t\n").unwrap();

        let store = open_values(&path, RecordPolicy::Strict);
        store.store("new".into(), TaggedValue::long(3)).unwrap();
        store.remove(&"gone".to_string()).unwrap();
        store.synchronize();
        drop(store);

        let store = open_values(&path, RecordPolicy::Strict);
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["old"], TaggedValue::long(1));
        assert_eq!(snapshot["new"], TaggedValue::long(3));
    }

    #[test]
    fn test_memory_wins_over_disk_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        fs::write(&path, "k\t1\t0\t1\t\n").unwrap();
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("k".into(), TaggedValue::long(2)).unwrap();
        assert_eq!(store.load().unwrap()["k"], TaggedValue::long(2));
    }

    #[test]
    fn test_strict_policy_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        fs::write(&path, "good\t1\t0\t1\t\nbad\t7\tjunk\t\n").unwrap();
        let store = open_values(&path, RecordPolicy::Strict);
        let err = store.load().unwrap_err();
        assert!(matches!(err, AnalyticsError::Deserialization(_)));
        assert!(store.is_empty());

        // Still writable, and the unread records survive the rewrite.
        store.store("x".into(), TaggedValue::long(2)).unwrap();
        store.synchronize();
        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("good\t1\t0\t1\t\n"));
        assert!(on_disk.contains("bad\t7\tjunk\t\n"));
        assert!(on_disk.contains("x\t1\t0\t2\t\n"));
        assert_eq!(on_disk.lines().count(), 3);

        assert!(matches!(store.load(), Err(AnalyticsError::Deserialization(_))));
        assert!(matches!(store.swap(), Err(AnalyticsError::Deserialization(_))));
        assert!(!store.backup_path().exists());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_skip_policy_loads_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        fs::write(&path, "good\t1\t0\t1\t\nbad\t7\tjunk\t\nno-separator\n").unwrap();
        let store = open_values(&path, RecordPolicy::SkipMalformed);
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["good"], TaggedValue::long(1));

        store.synchronize();
        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("bad"));
    }

    #[test]
    fn test_key_with_separator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_values(&dir.path().join("s"), RecordPolicy::Strict);
        let err = store.store("a\tb".into(), TaggedValue::long(1)).unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidArgument(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = Arc::new(open_values(&path, RecordPolicy::Strict));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .store(format!("t{}-{}", t, i), TaggedValue::long(i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        store.synchronize();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 100);
    }

    #[test]
    fn test_swap_during_concurrent_writes_loses_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = Arc::new(open_values(&path, RecordPolicy::Strict));

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        store
                            .store(format!("t{}-{}", t, i), TaggedValue::long(i))
                            .unwrap();
                    }
                })
            })
            .collect();
        let swapper = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut batches = Vec::new();
                for _ in 0..50 {
                    batches.push(store.swap().unwrap());
                    std::thread::yield_now();
                }
                batches
            })
        };

        for h in writers {
            h.join().unwrap();
        }
        let batches = swapper.join().unwrap();
        store.synchronize();

        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for key in batches
            .iter()
            .flat_map(|batch| batch.keys())
            .chain(store.load().unwrap().keys())
        {
            total += 1;
            assert!(seen.insert(key.clone()), "{} returned twice", key);
        }
        assert_eq!(total, 2000);
        assert_eq!(seen.len(), 2000);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), store.len());
    }

    #[test]
    fn test_event_records() {
        use crate::event::{EventKind, TracePayload};
        use crate::validator::AttributeValidator;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        let validator = Arc::new(AttributeValidator::standard());
        let mut event = AnalyticEvent::with_trace_payload(
            EventKind::Request,
            100,
            2.0,
            Some(&TracePayload::new("g", "t")),
            Arc::clone(&validator),
        )
        .unwrap();
        event.add_attribute("requestMethod", "GET").unwrap();

        let deserializer_validator = Arc::clone(&validator);
        {
            let store: DurableStore<u64, AnalyticEvent> = DurableStore::open(
                &path,
                move |text| AnalyticEvent::deserialize(text, Arc::clone(&deserializer_validator)),
                RecordPolicy::Strict,
            )
            .unwrap();
            store.store(7, event.clone()).unwrap();
        }

        let validator_again = Arc::clone(&validator);
        let store: DurableStore<u64, AnalyticEvent> = DurableStore::open(
            &path,
            move |text| AnalyticEvent::deserialize(text, Arc::clone(&validator_again)),
            RecordPolicy::Strict,
        )
        .unwrap();
        assert_eq!(store.load().unwrap()[&7], event);
    }

    #[test]
    fn test_close_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("a".into(), TaggedValue::long(1)).unwrap();
        store.close();
        let store = open_values(&path, RecordPolicy::Strict);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("s");
        let store = open_values(&path, RecordPolicy::Strict);
        store.store("a".into(), TaggedValue::long(1)).unwrap();
        store.synchronize();
        assert!(path.exists());
    }
}
