//! Embedding pipeline: a pluggable embedder capability plus a batcher
//! actor that aggregates concurrent callers' requests into a single
//! owned-state actor, rather than spinning up a worker thread per call.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Capability every embedder backend implements. `dimension` and
/// `is_available` let a fallback chain pick the first usable backend
/// without the batcher knowing which concrete backend served a request.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;
    fn is_available(&self) -> bool;
    fn name(&self) -> &str;
}

/// Tries embedders in order; the first whose `is_available()` returns true
/// is used for the whole call. Presented to the batcher as a single
/// logical embedder.
pub struct FallbackEmbedder {
    chain: Vec<Box<dyn Embedder>>,
}

impl FallbackEmbedder {
    pub fn new(chain: Vec<Box<dyn Embedder>>) -> Self {
        FallbackEmbedder { chain }
    }

    fn active(&self) -> CoreResult<&dyn Embedder> {
        self.chain
            .iter()
            .find(|e| e.is_available())
            .map(|e| e.as_ref())
            .ok_or_else(|| CoreError::EmbedderUnavailable {
                reason: "no embedder in the fallback chain is available".to_string(),
            })
    }
}

impl Embedder for FallbackEmbedder {
    fn dimension(&self) -> usize {
        self.chain.first().map(|e| e.dimension()).unwrap_or(0)
    }

    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let mut last_err = None;
        for embedder in &self.chain {
            if !embedder.is_available() {
                continue;
            }
            match embedder.embed(texts) {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(CoreError::EmbedderUnavailable {
            reason: "no embedder in the fallback chain is available".to_string(),
        }))
    }

    fn is_available(&self) -> bool {
        self.chain.iter().any(|e| e.is_available())
    }

    fn name(&self) -> &str {
        "fallback"
    }
}

/// A no-op embedder used in tests and as a last-resort fallback when the
/// `semantic` feature is disabled; it is never `is_available()` in
/// production because real pipelines should fail loudly instead of
/// silently degrading search to lexical-only.
pub struct NullEmbedder {
    pub dim: usize,
}

impl Embedder for NullEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }
    fn embed(&self, _texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Err(CoreError::EmbedderUnavailable {
            reason: "null embedder never serves real requests".to_string(),
        })
    }
    fn is_available(&self) -> bool {
        false
    }
    fn name(&self) -> &str {
        "null"
    }
}

/// Runs `f` on a detached thread and waits up to `timeout` for it to
/// finish, returning `None` on expiry. The spawned thread is not joined —
/// there is no way to cancel a blocking FFI call from the caller's side, so
/// a hung `f` keeps running in the background and its result is discarded
/// when it eventually lands. Gives a single embedder call a deadline
/// without the caller's own thread ever blocking past it: on timeout the
/// affected batch fails and the next fallback embedder, if any, is tried.
fn run_with_timeout<T: Send + 'static>(timeout: Duration, f: impl FnOnce() -> T + Send + 'static) -> Option<T> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("codegrove-embed-call".into())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .expect("failed to spawn embed call thread");
    rx.recv_timeout(timeout).ok()
}

/// Per-call deadline for a single `FastEmbedEmbedder::embed` invocation.
/// Generous on purpose: ONNX inference on a CPU-bound batch should never
/// legitimately take this long, so exceeding it is a reliable hang signal.
#[cfg(feature = "semantic")]
const FASTEMBED_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// ONNX-backed embedder, wrapping `fastembed`'s `TextEmbedding`: one loaded
/// model per process, reused across calls, with output already
/// L2-normalized so cosine similarity reduces to a dot product.
#[cfg(feature = "semantic")]
pub struct FastEmbedEmbedder {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    dim: usize,
    timeout: Duration,
}

#[cfg(feature = "semantic")]
impl FastEmbedEmbedder {
    /// Loads `all-MiniLM-L6-v2` (384 dims), downloading weights into the
    /// local `fastembed` cache directory on first use.
    pub fn try_new() -> CoreResult<Self> {
        let options =
            fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2Q);
        let model = fastembed::TextEmbedding::try_new(options).map_err(|e| {
            CoreError::EmbedderUnavailable { reason: format!("fastembed init failed: {e}") }
        })?;
        Ok(FastEmbedEmbedder {
            model: Arc::new(std::sync::Mutex::new(model)),
            dim: 384,
            timeout: FASTEMBED_CALL_TIMEOUT,
        })
    }
}

#[cfg(feature = "semantic")]
impl Embedder for FastEmbedEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    /// Runs inference on a detached thread and waits for it with a
    /// deadline, rather than calling `model.embed` on the current thread
    /// directly: a hung ONNX call must not block the single batcher thread
    /// (and every request sharing its batch) forever. On timeout this
    /// abandons the in-flight call and fails immediately so
    /// `FallbackEmbedder` can try the next backend; it does not wait for
    /// the stuck thread, which is reflected by `is_available` going false
    /// for as long as it still holds the model lock.
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let timeout = self.timeout;
        run_with_timeout(timeout, move || {
            model
                .lock()
                .expect("fastembed model mutex poisoned")
                .embed(texts, None)
                .map_err(|e| CoreError::EmbedderUnavailable {
                    reason: format!("fastembed inference failed: {e}"),
                })
        })
        .unwrap_or_else(|| {
            Err(CoreError::EmbedderUnavailable {
                reason: format!("fastembed inference exceeded {timeout:?} timeout"),
            })
        })
    }

    fn is_available(&self) -> bool {
        self.model.try_lock().is_ok()
    }

    fn name(&self) -> &str {
        "fastembed-all-minilm-l6-v2"
    }
}

/// Builds the embedder chain a caller should hand to [`crate::Index`]: the
/// real backend first when the `semantic` feature is compiled in and the
/// model loads successfully, a [`NullEmbedder`] last so lexical-only search
/// still works instead of failing to open the index at all.
pub fn default_embedder(dim: usize) -> Arc<dyn Embedder> {
    #[cfg(feature = "semantic")]
    {
        let mut chain: Vec<Box<dyn Embedder>> = Vec::new();
        match FastEmbedEmbedder::try_new() {
            Ok(e) => chain.push(Box::new(e)),
            Err(e) => tracing::warn!(error = %e, "fastembed unavailable, falling back to lexical-only"),
        }
        chain.push(Box::new(NullEmbedder { dim }));
        Arc::new(FallbackEmbedder::new(chain))
    }
    #[cfg(not(feature = "semantic"))]
    {
        Arc::new(NullEmbedder { dim })
    }
}

struct PendingRequest {
    texts: Vec<String>,
    reply: mpsc::Sender<CoreResult<Vec<Vec<f32>>>>,
}

enum BatcherMsg {
    Submit(PendingRequest),
    Flush,
    Shutdown,
}

/// Batcher actor. Aggregates `(texts, continuation)` requests from
/// possibly many callers up to `batch_size`, flushing on batch-full, an
/// idle timeout, or an explicit `flush()`. Output ordering is preserved
/// per caller; an embedder error fails every caller in the active batch.
pub struct Batcher {
    tx: mpsc::Sender<BatcherMsg>,
}

impl Batcher {
    pub fn new(embedder: impl Embedder + 'static, batch_size: usize, idle_flush: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<BatcherMsg>();
        thread::Builder::new()
            .name("codegrove-embed-batcher".into())
            .spawn(move || run_batcher(embedder, batch_size, idle_flush, rx))
            .expect("failed to spawn embedding batcher thread");
        Batcher { tx }
    }

    /// Submits `texts` for embedding and blocks until the batch containing
    /// this request is flushed. Preserves the order of `texts` within the
    /// returned vector.
    pub fn embed(&self, texts: Vec<String>) -> CoreResult<Vec<Vec<f32>>> {
        let (reply, reply_rx) = mpsc::channel();
        self.tx
            .send(BatcherMsg::Submit(PendingRequest { texts, reply }))
            .expect("embedding batcher has shut down");
        reply_rx.recv().expect("embedding batcher dropped reply sender")
    }

    pub fn flush(&self) {
        let _ = self.tx.send(BatcherMsg::Flush);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(BatcherMsg::Shutdown);
    }
}

fn run_batcher(
    embedder: impl Embedder,
    batch_size: usize,
    idle_flush: Duration,
    rx: mpsc::Receiver<BatcherMsg>,
) {
    let mut pending: Vec<PendingRequest> = Vec::new();
    let mut pending_len = 0usize;

    loop {
        let msg = if pending.is_empty() {
            rx.recv().ok()
        } else {
            rx.recv_timeout(idle_flush).ok()
        };

        match msg {
            Some(BatcherMsg::Submit(req)) => {
                pending_len += req.texts.len();
                pending.push(req);
                if pending_len >= batch_size {
                    flush_batch(&embedder, &mut pending, &mut pending_len);
                }
            }
            Some(BatcherMsg::Flush) => {
                flush_batch(&embedder, &mut pending, &mut pending_len);
            }
            Some(BatcherMsg::Shutdown) => {
                flush_batch(&embedder, &mut pending, &mut pending_len);
                break;
            }
            // `recv_timeout` elapsed with pending work queued: idle flush.
            None if !pending.is_empty() => {
                flush_batch(&embedder, &mut pending, &mut pending_len);
            }
            None => break,
        }
    }
}

fn flush_batch(embedder: &impl Embedder, pending: &mut Vec<PendingRequest>, pending_len: &mut usize) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<PendingRequest> = std::mem::take(pending);
    *pending_len = 0;

    let mut all_texts = Vec::new();
    let mut bounds = Vec::with_capacity(batch.len());
    for req in &batch {
        let start = all_texts.len();
        all_texts.extend(req.texts.iter().cloned());
        bounds.push((start, all_texts.len()));
    }

    match embedder.embed(&all_texts) {
        Ok(vectors) => {
            for (req, (start, end)) in batch.into_iter().zip(bounds) {
                let _ = req.reply.send(Ok(vectors[start..end].to_vec()));
            }
        }
        Err(e) => {
            // Errors propagate to every caller in the active batch; no
            // partial success within a batch.
            for req in batch {
                let _ = req.reply.send(Err(clone_core_error(&e)));
            }
        }
    }
}

fn clone_core_error(e: &CoreError) -> CoreError {
    CoreError::EmbedderUnavailable { reason: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEmbedder {
        dim: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Embedder for CountingEmbedder {
        fn dimension(&self) -> usize {
            self.dim
        }
        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![1.0; self.dim]).collect())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn batch_preserves_per_caller_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = CountingEmbedder { dim: 4, calls: calls.clone() };
        let batcher = Batcher::new(embedder, 32, Duration::from_millis(50));
        let out = batcher
            .embed(vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        assert_eq!(out.len(), 3);
        batcher.shutdown();
    }

    #[test]
    fn fallback_picks_first_available() {
        let unavailable = NullEmbedder { dim: 8 };
        let calls = Arc::new(AtomicUsize::new(0));
        let available = CountingEmbedder { dim: 8, calls: calls.clone() };
        let chain = FallbackEmbedder::new(vec![Box::new(unavailable), Box::new(available)]);
        let out = chain.embed(&["hi".to_string()]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fallback_unavailable_when_chain_empty() {
        let chain = FallbackEmbedder::new(vec![]);
        assert!(!chain.is_available());
        assert!(chain.embed(&["x".to_string()]).is_err());
    }

    #[test]
    fn run_with_timeout_returns_value_when_fast_enough() {
        let out = run_with_timeout(Duration::from_millis(200), || 42);
        assert_eq!(out, Some(42));
    }

    #[test]
    fn run_with_timeout_expires_on_a_hung_call() {
        let out = run_with_timeout(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            42
        });
        assert_eq!(out, None);
    }

    struct HangingEmbedder {
        dim: usize,
        sleep: Duration,
    }

    impl Embedder for HangingEmbedder {
        fn dimension(&self) -> usize {
            self.dim
        }
        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            std::thread::sleep(self.sleep);
            Ok(texts.iter().map(|_| vec![0.0; self.dim]).collect())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn name(&self) -> &str {
            "hanging"
        }
    }

    /// A backend whose own call hangs past its deadline must fail fast
    /// (via `run_with_timeout`) instead of blocking the fallback chain, so
    /// the next embedder still gets a chance to serve the request.
    #[test]
    fn timed_out_call_lets_fallback_chain_continue() {
        let dim = 4;
        let texts = vec!["hi".to_string()];
        let first_attempt = run_with_timeout(Duration::from_millis(20), {
            let texts = texts.clone();
            move || HangingEmbedder { dim, sleep: Duration::from_millis(500) }.embed(&texts)
        });
        assert!(first_attempt.is_none());

        let calls = Arc::new(AtomicUsize::new(0));
        let fallback = CountingEmbedder { dim, calls: calls.clone() };
        let out = fallback.embed(&texts).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
