use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// A deferred unit of work. Nothing runs until the batcher calls it.
pub type Task = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub fn task<F, Fut>(f: F) -> Task
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

/// Runs queued tasks in slices of at most `size` concurrent tasks. Each slice fully settles
/// before the next one starts, and there is at most one drain loop per batcher.
pub struct TaskBatcher {
    size: usize,
    state: Mutex<BatcherState>,
}

#[derive(Default)]
struct BatcherState {
    queue: VecDeque<Task>,
    drain: Option<Shared<BoxFuture<'static, ()>>>,
}

impl TaskBatcher {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            state: Mutex::new(BatcherState::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().drain.is_none()
    }

    /// Append `tasks` to the queue and wait until the queue has been drained. If a drain is
    /// already running, the tasks are picked up by it and this call waits for that drain.
    pub async fn add_and_run(self: &Arc<Self>, tasks: impl IntoIterator<Item = Task>) {
        let drain = {
            let mut state = self.state.lock();
            state.queue.extend(tasks);
            match &state.drain {
                Some(drain) => drain.clone(),
                None => {
                    let batcher = Arc::clone(self);
                    let handle = tokio::spawn(batcher.drain());
                    let drain = async move {
                        if let Err(e) = handle.await {
                            warn!("Task batcher drain loop aborted: {e}");
                        }
                    }
                    .boxed()
                    .shared();
                    state.drain = Some(drain.clone());
                    drain
                }
            }
        };
        drain.await;
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let batch: Vec<Task> = {
                let mut state = self.state.lock();
                if state.queue.is_empty() {
                    state.drain = None;
                    return;
                }
                let count = self.size.min(state.queue.len());
                state.queue.drain(..count).collect()
            };
            debug!("Running batch of {} task(s)", batch.len());
            let outcomes = join_all(
                batch
                    .into_iter()
                    .map(|task| AssertUnwindSafe(task()).catch_unwind()),
            )
            .await;
            for outcome in outcomes {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Batched task failed: {e:#}"),
                    Err(_) => warn!("Batched task panicked"),
                }
            }
        }
    }
}
