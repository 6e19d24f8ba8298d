use std::io;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use querygate_worker::wire::{
    DecodedRequest, ResponseEnvelope, Status, WireCodec, decode_request, encode_response,
    read_frame, write_frame,
};
use querygate_worker::{Dispatcher, GatewayConfig, telemetry};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};

#[derive(Parser, Debug)]
#[command(name = "querygate-worker", about = "Guarded read-only query worker over framed stdio")]
struct Args {
    /// Requests allowed to wait for a free slot before new ones get `Busy`.
    #[arg(long, default_value_t = 64)]
    max_queue: usize,

    /// Concurrent requests; defaults to the number of CPUs.
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, env = "QUERYGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long)]
    json_logs: bool,
}

type Outgoing = (WireCodec, ResponseEnvelope);

fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(&args.log_level, args.json_logs)?;

    let threads = args.threads.unwrap_or_else(|| {
        thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4)
    });
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .enable_all()
        .thread_name("querygate-worker")
        .build()
        .context("failed to build tokio runtime")?;

    let config = GatewayConfig::from_env().context("invalid QUERYGATE_* configuration")?;
    tracing::info!(
        backend = %config.connection.target.describe(),
        pool_size = config.connection.pool.max_size,
        max_workers = config.scheduler.max_workers,
        user_namespaces = config.user_namespaces.len(),
        max_iterations = config.orchestrator().max_iterations,
        "starting querygate worker"
    );
    let gateway = runtime
        .block_on(config.build_gateway())
        .context("failed to build gateway")?;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(gateway), config.scheduler.clone()));

    let (request_tx, request_rx) = mpsc::channel::<DecodedRequest>(args.max_queue.max(1));
    let (response_tx, response_rx) = mpsc::channel::<Outgoing>(args.max_queue.max(1));

    let writer = thread::Builder::new()
        .name("querygate-writer".into())
        .spawn(move || write_loop(response_rx))
        .context("failed to spawn writer thread")?;

    let dispatch = runtime.spawn(dispatch_loop(
        request_rx,
        response_tx.clone(),
        Arc::clone(&dispatcher),
        threads,
    ));

    read_loop(&request_tx, &response_tx, &dispatcher);

    drop(request_tx);
    if let Err(err) = runtime.block_on(dispatch) {
        tracing::error!(error = %err, "dispatch loop failed");
    }
    drop(response_tx);
    if writer.join().is_err() {
        tracing::error!("writer thread panicked");
    }
    tracing::info!("stdin closed, worker exiting");
    Ok(())
}

/// Reads frames until EOF. Cancels are answered here so they never queue
/// behind the request they target.
fn read_loop(
    request_tx: &mpsc::Sender<DecodedRequest>,
    response_tx: &mpsc::Sender<Outgoing>,
    dispatcher: &Dispatcher,
) {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "unreadable frame, closing");
                respond(
                    response_tx,
                    WireCodec::Json,
                    ResponseEnvelope::failure(0, None, Status::InvalidInput, err.to_string()),
                );
                break;
            }
        };
        let decoded = match decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                respond(
                    response_tx,
                    WireCodec::Json,
                    ResponseEnvelope::failure(0, None, Status::InvalidInput, err.to_string()),
                );
                continue;
            }
        };
        if decoded.envelope.entry == "__cancel__" {
            let response = dispatcher.cancel(&decoded.envelope);
            respond(response_tx, decoded.wire, response);
            continue;
        }
        match request_tx.try_send(decoded) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                tracing::warn!(request_id = request.envelope.request_id, "queue full");
                respond(
                    response_tx,
                    request.wire,
                    ResponseEnvelope::failure(
                        request.envelope.request_id,
                        Some(&request.envelope.entry),
                        Status::Busy,
                        "worker queue full",
                    ),
                );
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

fn respond(response_tx: &mpsc::Sender<Outgoing>, wire: WireCodec, response: ResponseEnvelope) {
    if response_tx.blocking_send((wire, response)).is_err() {
        tracing::warn!("response channel closed, dropping response");
    }
}

async fn dispatch_loop(
    mut request_rx: mpsc::Receiver<DecodedRequest>,
    response_tx: mpsc::Sender<Outgoing>,
    dispatcher: Arc<Dispatcher>,
    concurrency: usize,
) {
    let concurrency = concurrency.max(1);
    let slots = Arc::new(Semaphore::new(concurrency));
    while let Some(request) = request_rx.recv().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let queue_depth = request_rx.len();
        let dispatcher = Arc::clone(&dispatcher);
        let response_tx = response_tx.clone();
        tokio::spawn(async move {
            let wire = request.wire;
            let response = dispatcher.handle(request, queue_depth).await;
            drop(permit);
            if response_tx.send((wire, response)).await.is_err() {
                tracing::warn!("response channel closed, dropping response");
            }
        });
    }
    // Wait for in-flight requests before the writer is shut down.
    if let Ok(all) = slots.acquire_many(concurrency as u32).await {
        drop(all);
    }
}

fn write_loop(mut response_rx: mpsc::Receiver<Outgoing>) {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    while let Some((wire, response)) = response_rx.blocking_recv() {
        let encoded = match encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            tracing::error!(error = %err, "failed to write response");
            break;
        }
    }
}
