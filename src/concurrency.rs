//! Background executor for asynchronous disk reads.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::{Result, ShuffleError};

/// A unit of work run on an I/O thread.
pub type IoTask = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Task(IoTask),
    Shutdown,
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

/// A fixed pool of threads executing disk reads for subpartition views.
///
/// Submission never blocks: the queue is unbounded since every view keeps at
/// most one read in flight.
pub struct IoExecutor {
    workers: Mutex<Vec<Worker>>,
    sender: Sender<Message>,
    shutdown: AtomicBool,
    in_flight_tasks: Arc<AtomicUsize>,
}

impl IoExecutor {
    /// Creates an executor with `num_threads` I/O threads.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            warn!("IoExecutor::new called with 0 threads; defaulting to 1");
            1
        } else {
            num_threads
        };

        let (sender, receiver) = unbounded::<Message>();
        let in_flight_tasks = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let receiver = receiver.clone();
            let in_flight_tasks = Arc::clone(&in_flight_tasks);

            match thread::Builder::new()
                .name(format!("hybrid-shuffle-io-{}", id))
                .spawn(move || run_worker(id, receiver, in_flight_tasks))
            {
                Ok(thread) => workers.push(Worker {
                    id,
                    thread: Some(thread),
                }),
                Err(e) => {
                    error!("Failed to spawn IO thread {}: {}", id, e);
                    break;
                }
            }
        }

        if workers.is_empty() {
            warn!("IoExecutor failed to spawn any thread; submitted reads will never run");
        }

        Self {
            workers: Mutex::new(workers),
            sender,
            shutdown: AtomicBool::new(false),
            in_flight_tasks,
        }
    }

    /// Creates an executor sized to the CPUs available to this process.
    pub fn with_default_threads() -> Self {
        Self::new(crate::cgroup::default_io_threads())
    }

    /// Queues a task.
    #[instrument(skip(self, task))]
    pub fn submit(&self, task: IoTask) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ShuffleError::ExecutorShutDown);
        }

        self.in_flight_tasks.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Message::Task(task))
            .map_err(ShuffleError::from)
            .inspect_err(|_| {
                self.in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
            })
    }

    /// Number of queued or running tasks.
    pub fn active_tasks(&self) -> usize {
        self.in_flight_tasks.load(Ordering::Acquire)
    }

    pub fn num_threads(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Waits until every queued or running task has completed.
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        while self.in_flight_tasks.load(Ordering::Acquire) > 0 {
            if start.elapsed() > timeout {
                return Err(ShuffleError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "{} IO tasks still running after {}ms",
                        self.active_tasks(),
                        timeout.as_millis()
                    ),
                )));
            }
            thread::sleep(Duration::from_millis(5));
        }

        Ok(())
    }

    /// Stops accepting tasks, drains the queue and joins all threads.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down IO executor");

        let drained = self.wait_for_completion(Duration::from_secs(30));

        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Message::Shutdown);
        }

        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                match thread.join() {
                    Ok(_) => debug!("IO thread {} shut down", worker.id),
                    Err(_) => error!("IO thread {} panicked during shutdown", worker.id),
                }
            }
        }

        drained
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("IO executor did not shut down cleanly: {}", e);
        }
    }
}

fn run_worker(id: usize, receiver: Receiver<Message>, in_flight_tasks: Arc<AtomicUsize>) {
    debug!("IO thread {} started", id);

    loop {
        let message = match receiver.recv() {
            Ok(msg) => msg,
            Err(_) => {
                debug!("IO thread {} channel disconnected", id);
                break;
            }
        };

        match message {
            Message::Task(task) => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
                in_flight_tasks.fetch_sub(1, Ordering::AcqRel);
                if result.is_err() {
                    error!("IO thread {} task panicked", id);
                }
            }
            Message::Shutdown => break,
        }
    }
}
