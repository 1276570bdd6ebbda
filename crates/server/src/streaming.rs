//! Streaming response relay.
//!
//! Chunked/SSE upstream bodies are forwarded chunk-by-chunk without
//! buffering; every chunk flushes as hyper writes the frame. The
//! [`DeferredUsage`] guard travels inside the stream state, so the usage
//! event is emitted when the upstream finishes, errors, or the client
//! disconnects and drops the body mid-transfer.

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;

use tollgate_core::usage::DeferredUsage;

/// Wrap an upstream response into a pass-through body that counts
/// outbound bytes into the usage guard.
pub fn passthrough_body(response: reqwest::Response, usage: DeferredUsage) -> Body {
    let stream = response.bytes_stream();

    let counted = futures::stream::unfold(
        (Box::pin(stream), usage, false),
        |(mut stream, mut usage, finished)| async move {
            if finished {
                return None;
            }
            match stream.next().await {
                Some(Ok(chunk)) => {
                    usage.add_bytes_out(chunk.len() as u64);
                    Some((
                        Ok::<Bytes, std::io::Error>(chunk),
                        (stream, usage, false),
                    ))
                }
                Some(Err(e)) => {
                    usage.set_error(if e.is_timeout() {
                        "upstream_timeout"
                    } else {
                        "upstream_unavailable"
                    });
                    tracing::warn!(error = %e, "upstream stream aborted");
                    Some((Err(std::io::Error::other(e)), (stream, usage, true)))
                }
                None => None,
            }
        },
    );

    Body::from_stream(counted)
}
