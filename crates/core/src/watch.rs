//! File watcher: debounces `notify` events per path and hands coalesced
//! batches to an `Indexer` for a chunk-level reindex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::embed::Batcher;
use crate::error::{CoreError, CoreResult};
use crate::indexer::{IndexReport, Indexer};
use crate::store::lexical::LexicalStore;
use crate::store::vector::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// Watches `root` for filesystem changes and re-indexes affected paths
/// after a debounce period of quiet (default 500ms). Dropping
/// the handle (via `stop`) ends the watcher thread; the underlying
/// `notify::RecommendedWatcher` must stay alive for events to keep
/// arriving, so it is held for the handle's lifetime.
pub struct FileWatcher {
    _notify: RecommendedWatcher,
    debounce_thread: Option<thread::JoinHandle<()>>,
    stop_tx: mpsc::Sender<()>,
}

impl FileWatcher {
    pub fn start(
        root: impl AsRef<Path>,
        lexical: LexicalStore,
        vector: VectorStore,
        batcher: Arc<Batcher>,
        settings: Settings,
        on_reindex: impl Fn(&IndexReport) + Send + 'static,
    ) -> CoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let debounce = Duration::from_millis(settings.watch.debounce_ms);

        let (raw_tx, raw_rx) = mpsc::channel::<NotifyEvent>();
        let mut notify_watcher = RecommendedWatcher::new(
            move |res: Result<NotifyEvent, notify::Error>| {
                if let Ok(event) = res {
                    let _ = raw_tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| CoreError::StoreIoError(e.to_string()))?;

        notify_watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| CoreError::StoreIoError(e.to_string()))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let root_for_thread = root.clone();
        let debounce_thread = thread::Builder::new()
            .name("codegrove-watch-debounce".into())
            .spawn(move || {
                debounce_loop(
                    raw_rx,
                    stop_rx,
                    debounce,
                    root_for_thread,
                    lexical,
                    vector,
                    batcher,
                    settings,
                    on_reindex,
                )
            })
            .map_err(|e| CoreError::StoreIoError(e.to_string()))?;

        Ok(FileWatcher {
            _notify: notify_watcher,
            debounce_thread: Some(debounce_thread),
            stop_tx,
        })
    }

    /// Stops the watcher and blocks until any in-flight debounce batch has
    /// been flushed through the indexer.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.debounce_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Fixed poll tick `debounce_loop` uses to check for expired per-path
/// entries. Keyed independently of the debounce window itself so a path
/// goes ready promptly even while events keep arriving for other paths.
const DEBOUNCE_POLL_TICK: Duration = Duration::from_millis(25);

#[allow(clippy::too_many_arguments)]
fn debounce_loop(
    raw_rx: mpsc::Receiver<NotifyEvent>,
    stop_rx: mpsc::Receiver<()>,
    debounce: Duration,
    root: PathBuf,
    lexical: LexicalStore,
    vector: VectorStore,
    batcher: Arc<Batcher>,
    settings: Settings,
    on_reindex: impl Fn(&IndexReport),
) {
    let debouncer = Debouncer::new(debounce);
    let tick = debounce.min(DEBOUNCE_POLL_TICK);

    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }

        match raw_rx.recv_timeout(tick) {
            Ok(event) => {
                let Some(kind) = classify(&event.kind) else {
                    continue;
                };
                for path in event.paths {
                    debouncer.record(path, kind);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        let ready = debouncer.drain_ready();
        if !ready.is_empty() {
            let paths: Vec<PathBuf> = ready.into_iter().map(|e| e.path).collect();
            flush(&paths, &root, &lexical, &vector, &batcher, &settings, &on_reindex);
        }
    }

    // Flush whatever debounced but unprocessed work remains before exit,
    // regardless of whether its window has fully elapsed.
    let remaining: Vec<PathBuf> = debouncer.drain_all().into_iter().map(|e| e.path).collect();
    if !remaining.is_empty() {
        flush(&remaining, &root, &lexical, &vector, &batcher, &settings, &on_reindex);
    }
}

#[allow(clippy::too_many_arguments)]
fn flush(
    paths: &[PathBuf],
    root: &Path,
    lexical: &LexicalStore,
    vector: &VectorStore,
    batcher: &Batcher,
    settings: &Settings,
    on_reindex: &impl Fn(&IndexReport),
) {
    debug!(count = paths.len(), "flushing debounced changes");
    let indexer = Indexer::new(lexical, vector, batcher, settings);
    let report = indexer.reindex_paths(root, paths);
    if !report.errors.is_empty() {
        warn!(errors = ?report.errors, "errors while reindexing watched changes");
    }
    on_reindex(&report);
}

/// Coalescing layer used directly by tests and by callers that want to
/// drive debouncing without standing up a real `notify` watcher — pushes
/// raw events in, reads out the set of paths that survived the debounce
/// window. Kept separate from `FileWatcher` so the coalescing policy
/// (many modifications within the debounce window collapse to one
/// reindex) can be exercised deterministically.
pub struct Debouncer {
    pending: Mutex<HashMap<PathBuf, (ChangeKind, Instant)>>,
    window: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Debouncer {
            pending: Mutex::new(HashMap::new()),
            window,
        }
    }

    pub fn record(&self, path: PathBuf, kind: ChangeKind) {
        self.pending.lock().unwrap().insert(path, (kind, Instant::now()));
    }

    /// Paths whose last event is older than the debounce window.
    pub fn drain_ready(&self) -> Vec<ChangeEvent> {
        let mut pending = self.pending.lock().unwrap();
        let cutoff = Instant::now() - self.window;
        let ready: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, (_, t))| *t <= cutoff)
            .map(|(p, _)| p.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|p| pending.remove(&p).map(|(kind, _)| ChangeEvent { path: p, kind }))
            .collect()
    }

    /// Every still-pending path, regardless of window elapsed — used to
    /// flush remaining work on shutdown.
    pub fn drain_all(&self) -> Vec<ChangeEvent> {
        self.pending
            .lock()
            .unwrap()
            .drain()
            .map(|(path, (kind, _))| ChangeEvent { path, kind })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::Embedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn rapid_modifications_coalesce_to_one_ready_event() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let path = PathBuf::from("src/main.swift");
        for _ in 0..10 {
            debouncer.record(path.clone(), ChangeKind::Modified);
        }
        assert!(debouncer.drain_ready().is_empty());
        std::thread::sleep(Duration::from_millis(250));
        let ready = debouncer.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].path, path);
        assert_eq!(ready[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn distinct_paths_debounce_independently() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        debouncer.record(PathBuf::from("a.swift"), ChangeKind::Created);
        std::thread::sleep(Duration::from_millis(120));
        debouncer.record(PathBuf::from("b.swift"), ChangeKind::Created);
        let ready = debouncer.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].path, PathBuf::from("a.swift"));
    }

    struct ConstEmbedder;
    impl Embedder for ConstEmbedder {
        fn dimension(&self) -> usize {
            4
        }
        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn name(&self) -> &str {
            "const"
        }
    }

    #[test]
    fn watcher_reindexes_a_modified_file_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.swift"), "func add() {}\n").unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Arc::new(Batcher::new(ConstEmbedder, 32, Duration::from_millis(20)));
        let mut settings = Settings::default();
        settings.watch.debounce_ms = 100;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let watcher = FileWatcher::start(dir.path(), lexical, vector, batcher, settings, move |_report| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..10 {
            std::fs::write(dir.path().join("a.swift"), "func add() { 1 + 1 }\n").unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(400));

        watcher.stop();
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn stale_path_flushes_while_another_path_keeps_generating_events() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.swift"), "func add() {}\n").unwrap();
        std::fs::write(dir.path().join("b.swift"), "func sub() {}\n").unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Arc::new(Batcher::new(ConstEmbedder, 32, Duration::from_millis(20)));
        let mut settings = Settings::default();
        settings.watch.debounce_ms = 100;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let watcher = FileWatcher::start(dir.path(), lexical, vector, batcher, settings, move |_report| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        // a.swift gets one edit and then goes quiet...
        std::fs::write(dir.path().join("a.swift"), "func add() { 1 + 1 }\n").unwrap();
        // ...while b.swift keeps generating events well past a.swift's
        // debounce window. A correct per-path debouncer flushes a.swift
        // without waiting for b.swift's stream to go quiet.
        for _ in 0..20 {
            std::fs::write(dir.path().join("b.swift"), "func sub() { 1 - 1 }\n").unwrap();
            std::thread::sleep(Duration::from_millis(30));
        }

        watcher.stop();
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
