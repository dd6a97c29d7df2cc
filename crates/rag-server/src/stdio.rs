//! Newline-delimited JSON stdio loop (spec §6): one `RequestFrame` per
//! line in, one `ResponseFrame` per line out. Requests are dispatched
//! concurrently — a slow `query` must not stall `ping` behind it — and
//! replies are written back in whatever order they finish, matched to
//! the caller by `id` rather than by position.

use std::sync::Arc;

use rag_orchestrator::Orchestrator;
use rag_protocol::{parse_request, ResponseFrame};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reads `stdin` to EOF, dispatching each line as it arrives and writing
/// replies to `stdout` as they complete. Returns `Ok(())` on a clean EOF
/// (the client closed its write half) — that's the ordinary shutdown path,
/// not an error.
pub async fn run(orchestrator: Arc<Orchestrator>) -> io::Result<()> {
    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = io::stdout();

    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseFrame>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            let mut line = match serde_json::to_string(&reply) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to serialize response frame");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let tx = tx.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let reply = match parse_request(&line) {
                Ok(frame) => {
                    debug!(method = %frame.method, id = %frame.id, "dispatching request");
                    crate::dispatch::handle(&orchestrator, frame).await
                }
                Err(invalid) => invalid,
            };
            let _ = tx.send(reply);
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}
