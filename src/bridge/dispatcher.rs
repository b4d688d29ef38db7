//! Designated-thread dispatcher for host callables.
//!
//! Provides the "run this on thread T" / "is the current thread T"
//! primitives used by thread-affine host object calls. A single thread
//! drains a task channel in post order; posting never blocks the caller.

use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle, ThreadId};

use crate::{BridgeError, Result};

type Task = Box<dyn FnOnce() + Send>;

/// A dedicated thread executing posted tasks in order.
pub struct Dispatcher {
    tx: Option<Sender<Task>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl Dispatcher {
    /// Spawn the dispatcher thread.
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let (id_tx, id_rx) = mpsc::channel();

        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _ = id_tx.send(thread::current().id());
            while let Ok(task) = rx.recv() {
                task();
            }
        })?;

        let thread_id = id_rx
            .recv()
            .map_err(|_| BridgeError::Config("dispatcher thread exited during startup".to_string()))?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            thread_id,
        })
    }

    /// Post a task to run on the dispatcher thread. Returns `false` when
    /// the dispatcher has shut down.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.tx {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Whether the calling thread is the dispatcher thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.tx.take();
        // Joining from the dispatcher thread itself would deadlock.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn test_tasks_run_on_dispatcher_thread() {
        let dispatcher = Arc::new(Dispatcher::spawn("test-dispatcher").unwrap());
        assert!(!dispatcher.is_current());

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&dispatcher);
        dispatcher.post(move || {
            tx.send(inner.is_current()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn test_tasks_run_in_post_order() {
        let dispatcher = Dispatcher::spawn("test-dispatcher").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = Arc::clone(&order);
            dispatcher.post(move || order.lock().unwrap().push(i));
        }

        let (tx, rx) = mpsc::channel();
        dispatcher.post(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let seen = order.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_post_does_not_block() {
        let dispatcher = Dispatcher::spawn("test-dispatcher").unwrap();
        let blocked = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&blocked);
        let (tx, rx) = mpsc::channel();
        dispatcher.post(move || {
            // Keep the dispatcher busy until the main thread says so.
            rx.recv().unwrap();
            flag.store(false, Ordering::SeqCst);
        });

        // Posting more work while the dispatcher is busy returns instantly.
        for _ in 0..10 {
            assert!(dispatcher.post(|| {}));
        }
        assert!(blocked.load(Ordering::SeqCst));
        tx.send(()).unwrap();
    }

    #[test]
    fn test_drop_joins_and_stops_accepting() {
        let dispatcher = Dispatcher::spawn("test-dispatcher").unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        dispatcher.post(move || flag.store(true, Ordering::SeqCst));
        drop(dispatcher);

        assert!(ran.load(Ordering::SeqCst));
    }
}
