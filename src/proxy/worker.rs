//! Bounded worker pool
//!
//! Caps the number of concurrently in-flight forwards. Jobs enter a bounded
//! queue; once it fills, submitters block until a slot frees — backpressure
//! slows acceptance instead of dropping work. Each worker is bound to one
//! proxy core at start time and forwards through it directly.

use super::{status_response, ProxyCore, ProxyError};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Worker pool sizing
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    /// Number of long-lived worker tasks
    pub workers: usize,
    /// Capacity of the job queue
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 16,
        }
    }
}

/// One unit of deferred proxy work
struct Job {
    request: Request<Bytes>,
    via_tls: bool,
    /// Single-writer completion signal: sending consumes the sender, so the
    /// submitter can never observe two competing responses
    respond_to: oneshot::Sender<Response<Full<Bytes>>>,
    deadline: Instant,
}

/// Fixed-size set of workers consuming a bounded job queue
pub struct WorkerPool {
    job_tx: mpsc::Sender<Job>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers bound to the given core
    pub fn start(config: WorkerPoolConfig, core: Arc<ProxyCore>) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (shutdown_tx, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&job_rx),
                shutdown_tx.subscribe(),
                Arc::clone(&core),
            )));
        }

        info!("worker pool started with {} workers", config.workers);

        Self {
            job_tx,
            shutdown_tx,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a request and wait for its response
    ///
    /// Blocks while the queue is full. Returns [`ProxyError::PoolStopped`]
    /// if the pool shuts down before the job is accepted, and
    /// [`ProxyError::Timeout`] if the job's deadline elapses first.
    pub async fn submit(
        &self,
        request: Request<Bytes>,
        via_tls: bool,
        timeout: Duration,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        if *self.shutdown_tx.borrow() {
            return Err(ProxyError::PoolStopped);
        }

        let deadline = Instant::now() + timeout;
        let (respond_to, done) = oneshot::channel();
        let job = Job {
            request,
            via_tls,
            respond_to,
            deadline,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            sent = self.job_tx.send(job) => {
                if sent.is_err() {
                    return Err(ProxyError::PoolStopped);
                }
            }
            _ = shutdown_rx.wait_for(|stopped| *stopped) => {
                return Err(ProxyError::PoolStopped);
            }
        }

        match tokio::time::timeout_at(deadline, done).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProxyError::WorkerGone),
            Err(_) => Err(ProxyError::Timeout),
        }
    }

    /// Signal shutdown and wait for every worker to finish its current job
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    core: Arc<ProxyCore>,
) {
    loop {
        // Claim under the lock, then release it before processing so other
        // workers can claim concurrently
        let job = {
            let mut rx = queue.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown_rx.wait_for(|stopped| *stopped) => None,
            }
        };

        let Some(job) = job else {
            break;
        };

        process_job(id, job, &core).await;
    }

    debug!("worker {} exited", id);
}

async fn process_job(id: usize, job: Job, core: &ProxyCore) {
    let Job {
        request,
        via_tls,
        respond_to,
        deadline,
    } = job;

    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = tokio::select! {
        result = core.forward(request, via_tls) => match result {
            Ok(response) => response,
            Err(e) => {
                // A failed job never takes the worker down with it
                warn!("worker {}: forward failed for {} {}: {}", id, method, uri, e);
                super::error_response(&e)
            }
        },
        _ = tokio::time::sleep_until(deadline) => {
            warn!("worker {}: deadline elapsed for {} {}", id, method, uri);
            status_response(StatusCode::GATEWAY_TIMEOUT, "Request timed out")
        }
    };

    let _ = respond_to.send(response);
}
