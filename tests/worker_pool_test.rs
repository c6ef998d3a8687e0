//! Worker pool concurrency properties
//!
//! Backpressure under saturation, orderly shutdown, and submit semantics
//! against a gated local upstream.

use bytes::Bytes;
use http::header::HOST;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use veil_proxy::proxy::{Mode, ProxyCore, ProxyService, WorkerPool, WorkerPoolConfig};

/// Upstream that answers only once the gate has permits
async fn spawn_gated_upstream(gate: Arc<Semaphore>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let gate = Arc::clone(&gate);
                    async move {
                        let _ = req.into_body().collect().await;
                        let permit = gate.acquire().await.unwrap();
                        drop(permit);
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

fn request_for(path: &str) -> Request<Bytes> {
    Request::builder()
        .uri(path)
        .header(HOST, "proxy.example")
        .body(Bytes::new())
        .unwrap()
}

fn fixed_core(addr: SocketAddr) -> Arc<ProxyCore> {
    Arc::new(ProxyCore::new(Mode::Fixed(
        format!("http://{}", addr).parse().unwrap(),
    )))
}

#[tokio::test]
async fn test_backpressure_blocks_excess_submitters() {
    let gate = Arc::new(Semaphore::new(0));
    let addr = spawn_gated_upstream(Arc::clone(&gate)).await;

    // One worker, one queue slot: a third job has nowhere to go
    let pool = Arc::new(WorkerPool::start(
        WorkerPoolConfig {
            workers: 1,
            queue_capacity: 1,
        },
        fixed_core(addr),
    ));

    let mut submitters = Vec::new();
    for i in 0..3 {
        let pool = Arc::clone(&pool);
        submitters.push(tokio::spawn(async move {
            pool.submit(
                request_for(&format!("/job/{}", i)),
                false,
                Duration::from_secs(10),
            )
            .await
        }));
    }

    // Give the first job time to be claimed and the second to be queued;
    // the third submitter must still be blocked on the full queue
    tokio::time::sleep(Duration::from_millis(300)).await;
    let blocked = submitters.iter().filter(|s| !s.is_finished()).count();
    assert_eq!(blocked, 3, "no submitter may complete while the gate is shut");

    // Open the gate: every job completes, none were dropped
    gate.add_permits(16);
    for submitter in submitters {
        let response = submitter.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    pool.stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_jobs() {
    let gate = Arc::new(Semaphore::new(0));
    let addr = spawn_gated_upstream(Arc::clone(&gate)).await;

    let pool = Arc::new(WorkerPool::start(
        WorkerPoolConfig {
            workers: 2,
            queue_capacity: 4,
        },
        fixed_core(addr),
    ));

    let worker_bound = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            pool.submit(request_for("/in-flight"), false, Duration::from_secs(10))
                .await
        })
    };

    // Let a worker claim the job, then stop while it is mid-forward
    tokio::time::sleep(Duration::from_millis(200)).await;
    gate.add_permits(16);
    pool.stop().await;

    assert!(pool.is_stopped());

    // The claimed job was finished, not abandoned
    let response = worker_bound.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_submit_after_stop_returns_unhandled() {
    let gate = Arc::new(Semaphore::new(16));
    let addr = spawn_gated_upstream(gate).await;

    let pool = WorkerPool::start(WorkerPoolConfig::default(), fixed_core(addr));
    pool.stop().await;

    let result = pool
        .submit(request_for("/late"), false, Duration::from_secs(1))
        .await;
    assert!(result.is_err(), "a stopped pool accepts no work");
}

#[tokio::test]
async fn test_pooled_service_forwards_normally() {
    let gate = Arc::new(Semaphore::new(16));
    let addr = spawn_gated_upstream(gate).await;

    let core = ProxyCore::new(Mode::Fixed(
        format!("http://{}", addr).parse().unwrap(),
    ));
    let mut service = ProxyService::new(core, Duration::from_secs(5));
    service.enable_worker_pool(WorkerPoolConfig {
        workers: 2,
        queue_capacity: 4,
    });

    let request = Request::builder()
        .uri("/through-the-pool")
        .header(HOST, "proxy.example")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let response = service.handle(request, false).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");

    service.shutdown().await;
}

#[tokio::test]
async fn test_worker_survives_failed_jobs() {
    // No upstream at all: every forward fails, but the pool keeps serving
    let core = Arc::new(
        ProxyCore::new(Mode::Fixed("http://127.0.0.1:9".parse().unwrap()))
            .with_connect_timeout(Duration::from_millis(200)),
    );
    let pool = WorkerPool::start(
        WorkerPoolConfig {
            workers: 1,
            queue_capacity: 2,
        },
        core,
    );

    for _ in 0..3 {
        let response = pool
            .submit(request_for("/doomed"), false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    pool.stop().await;
}
