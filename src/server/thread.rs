use std::{
    io,
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, trace};
use parking_lot::Mutex;

use super::port::{Completion, CompletionPort, Event};

/// Handles completions drained by the worker pool.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, completion: Completion);
}

/// Fixed set of threads blocked on one [`CompletionPort`].
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub(crate) fn new<D: Dispatch>(
        size: usize,
        port: &CompletionPort,
        dispatcher: Arc<D>,
    ) -> io::Result<Self> {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let receiver = port.receiver();

        for i in 0..size {
            match Worker::new(i, Arc::clone(&receiver), Arc::clone(&dispatcher)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    let mut pool = Self { workers };
                    pool.shutdown(port);
                    return Err(e);
                }
            }
        }

        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wakes every worker with a shutdown token and waits for them to exit.
    pub(crate) fn shutdown(&mut self, port: &CompletionPort) {
        port.post_shutdown(self.workers.len());

        for worker in self.workers.drain(..) {
            debug!("Shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                debug!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new<D: Dispatch>(
        id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
        dispatcher: Arc<D>,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("ringnet-worker-{id}"))
            .spawn(move || {
                loop {
                    let event = receiver.lock().recv();
                    match event {
                        Ok(Event::Completion(completion)) => {
                            trace!("worker {id} dispatching {completion:?}");
                            dispatcher.dispatch(completion);
                        }
                        Ok(Event::Shutdown) => {
                            debug!("worker {id} stopping");
                            break;
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected!");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use crate::{
        memory::{Pool, PoolConfig},
        server::port::{CompletionKey, Overlapped},
    };

    use super::*;

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl Dispatch for Counter {
        fn dispatch(&self, completion: Completion) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if let Ok(n) = completion.result {
                self.bytes.fetch_add(n, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn workers_drain_shared_port() {
        let port = CompletionPort::new();
        let counter = Arc::new(Counter::default());
        let mut pool = WorkerPool::new(4, &port, Arc::clone(&counter)).unwrap();
        assert_eq!(pool.len(), 4);

        let operations = Pool::new(
            "operations",
            PoolConfig {
                chunk_size: 8,
                max_chunks: 8,
            },
            Overlapped::default,
        );
        for i in 0..40 {
            port.post(Completion {
                key: CompletionKey {
                    session: i % 3,
                    generation: 0,
                },
                result: Ok(2),
                operation: operations.allocate().unwrap(),
            });
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.seen.load(Ordering::SeqCst) < 40 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown(&port);

        assert_eq!(counter.seen.load(Ordering::SeqCst), 40);
        assert_eq!(counter.bytes.load(Ordering::SeqCst), 80);
        assert_eq!(operations.stats().in_use, 0);
        assert!(pool.is_empty());
    }
}
