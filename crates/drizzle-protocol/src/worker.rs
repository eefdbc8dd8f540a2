// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker side of the pipe protocol.
//!
//! A worker process reads [`RequestFrame`]s from fd 3 and answers with
//! [`ResponseFrame`]s on fd 4. The first frame it writes is the ready frame;
//! the node treats it as the end of the cold start.

use std::future::Future;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::message::{RequestFrame, ResponseFrame};

/// Descriptor a worker reads requests from.
pub const REQUEST_FD: i32 = 3;

/// Descriptor a worker writes responses to.
pub const RESPONSE_FD: i32 = 4;

/// Open the request/response pipes inherited from the node.
///
/// # Safety
///
/// The caller must guarantee that fds 3 and 4 are the pipe ends set up by the
/// node and that nothing else in the process owns them.
pub unsafe fn inherited_pipes() -> std::io::Result<(pipe::Receiver, pipe::Sender)> {
    // SAFETY: ownership of both descriptors is transferred to us by the caller.
    let (requests, responses) = unsafe {
        (
            OwnedFd::from_raw_fd(REQUEST_FD),
            OwnedFd::from_raw_fd(RESPONSE_FD),
        )
    };
    let receiver = pipe::Receiver::from_file(std::fs::File::from(requests))?;
    let sender = pipe::Sender::from_file(std::fs::File::from(responses))?;
    Ok((receiver, sender))
}

/// Serve requests until the node closes the request pipe.
///
/// Every request runs on its own task so slow calls do not hold up the rest;
/// responses are funnelled through a single writer task.
pub async fn serve<R, W, F, Fut>(reader: R, writer: W, handler: F) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);
    writer.write_frame(&ResponseFrame::ready()).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseFrame>();
    let writer_handle = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = writer.write_frame(&response).await {
                warn!(id = response.id, error = %e, "Failed to write response");
                if matches!(e, FrameError::WriteFailed(_)) {
                    break;
                }
            }
        }
    });

    let handler = Arc::new(handler);
    let outcome = loop {
        let request: RequestFrame = match reader.read_frame().await {
            Ok(request) => request,
            Err(FrameError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e),
        };
        debug!(id = request.id, "Received request");

        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = match handler(request.params).await {
                Ok(result) => ResponseFrame::ok(request.id, result),
                Err(error) => ResponseFrame::err(request.id, error),
            };
            let _ = tx.send(response);
        });
    };

    drop(tx);
    let _ = writer_handle.await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_serve_sends_ready_then_answers() {
        let (node_req, worker_req) = tokio::io::duplex(1024);
        let (worker_resp, node_resp) = tokio::io::duplex(1024);

        let worker = tokio::spawn(serve(worker_req, worker_resp, |params: Value| async move {
            Ok(json!({"echo": params}))
        }));

        let mut requests = FrameWriter::new(node_req);
        let mut responses = FrameReader::new(node_resp);

        let ready: ResponseFrame = responses.read_frame().await.unwrap();
        assert!(ready.is_ready());

        requests
            .write_frame(&RequestFrame::new(1, json!({"a": 1})))
            .await
            .unwrap();
        let response: ResponseFrame = responses.read_frame().await.unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.result, json!({"echo": {"a": 1}}));

        requests.shutdown().await.unwrap();
        drop(requests);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_reports_handler_errors() {
        let (node_req, worker_req) = tokio::io::duplex(1024);
        let (worker_resp, node_resp) = tokio::io::duplex(1024);

        tokio::spawn(serve(worker_req, worker_resp, |_params: Value| async move {
            Err::<Value, _>("function raised".to_string())
        }));

        let mut requests = FrameWriter::new(node_req);
        let mut responses = FrameReader::new(node_resp);
        let _ready: ResponseFrame = responses.read_frame().await.unwrap();

        requests
            .write_frame(&RequestFrame::new(2, json!({})))
            .await
            .unwrap();
        let response: ResponseFrame = responses.read_frame().await.unwrap();
        assert_eq!(response.error.as_deref(), Some("function raised"));
    }
}
