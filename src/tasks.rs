//! Cancellable background tasks keyed by name.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

type TaskMap<K> = Arc<Mutex<HashMap<K, (u64, AbortHandle)>>>;

pub struct BackgroundTasks<K = String> {
    tasks: TaskMap<K>,
    next_id: AtomicU64,
}

impl<K> Default for BackgroundTasks<K> {
    fn default() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

/// The eventual output of a background task.
pub struct TaskResult<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> TaskResult<T> {
    /// Waits for the task. `None` if it was cancelled.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}

impl<K> BackgroundTasks<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fut` in the background under `key`, cancelling any task already
    /// running under the same key.
    pub fn spawn<F, T>(&self, key: K, fut: F) -> TaskResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let task_key = key.clone();

        let mut map = match self.tasks.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let handle = tokio::spawn(async move {
            let output = fut.await;
            if let Ok(mut map) = tasks.lock()
                && map.get(&task_key).is_some_and(|(current, _)| *current == id)
            {
                map.remove(&task_key);
            }
            let _ = tx.send(output);
        });

        if let Some((_, previous)) = map.insert(key.clone(), (id, handle.abort_handle())) {
            debug!("Replacing background task {:?}", key);
            previous.abort();
        }
        TaskResult { rx }
    }

    /// Cancels the task under `key`. Returns whether one was running.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.tasks.lock().ok().and_then(|mut map| map.remove(key));
        match removed {
            Some((_, handle)) => {
                debug!("Cancelling background task {:?}", key);
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, key: &K) -> bool {
        self.tasks
            .lock()
            .map(|map| map.get(key).is_some_and(|(_, handle)| !handle.is_finished()))
            .unwrap_or(false)
    }
}
