//! Response envelope removal
//!
//! The backend answers `{"response": <inner>}` where the SDK expects
//! `<inner>`. Anything that does not look like that envelope is passed through
//! byte for byte; unwrapping never fails.

use crate::error::TransportError;
use crate::http::ByteStream;
use crate::tool_names::ToolNamePrefixer;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::Value;

/// A single SSE line never grows past this without a newline.
const MAX_LINE_BUFFER: usize = 16 * 1024 * 1024;

#[derive(Debug, PartialEq)]
pub enum Unwrapped<'a> {
    Inner(Vec<u8>),
    Raw(&'a [u8]),
}

impl Unwrapped<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Inner(bytes) => bytes,
            Self::Raw(bytes) => bytes,
        }
    }
}

pub fn unwrap_payload(bytes: &[u8]) -> Unwrapped<'_> {
    let Ok(Value::Object(mut envelope)) = serde_json::from_slice::<Value>(bytes) else {
        return Unwrapped::Raw(bytes);
    };
    match envelope.remove("response").map(|inner| serde_json::to_vec(&inner)) {
        Some(Ok(inner)) => Unwrapped::Inner(inner),
        _ => Unwrapped::Raw(bytes),
    }
}

/// Unwrap a buffered body and restore tool names in it.
pub fn unwrap_body(body: &Bytes, prefixer: Option<&ToolNamePrefixer>) -> Bytes {
    let unwrapped = unwrap_payload(body);
    let bytes = unwrapped.as_bytes();
    match prefixer {
        Some(prefixer) => Bytes::from(prefixer.restore(bytes).into_owned()),
        None => Bytes::copy_from_slice(bytes),
    }
}

/// Transform one SSE line, line terminator included.
pub fn unwrap_sse_line(line: &[u8], prefixer: Option<&ToolNamePrefixer>) -> Vec<u8> {
    let content_len = line
        .iter()
        .rposition(|b| *b != b'\n' && *b != b'\r')
        .map_or(0, |pos| pos + 1);
    let (content, terminator) = line.split_at(content_len);

    let mut out = match content.strip_prefix(b"data:") {
        Some(payload) => {
            let start = payload
                .iter()
                .position(|b| !b.is_ascii_whitespace())
                .unwrap_or(payload.len());
            match unwrap_payload(&payload[start..]) {
                Unwrapped::Inner(inner) => {
                    let mut rebuilt = Vec::with_capacity(inner.len() + 8);
                    rebuilt.extend_from_slice(b"data: ");
                    rebuilt.extend_from_slice(&inner);
                    rebuilt
                }
                _ => content.to_vec(),
            }
        }
        None => content.to_vec(),
    };

    if let Some(prefixer) = prefixer {
        out = prefixer.restore(&out).into_owned();
    }
    out.extend_from_slice(terminator);
    out
}

/// Lazily unwrap an SSE body.
///
/// Lines split across chunks are reassembled first. Each input chunk yields at
/// most one output chunk containing its completed lines. The first error from
/// `inner` is forwarded and ends the stream; dropping the returned stream
/// drops `inner`.
pub fn unwrap_stream(inner: ByteStream, prefixer: Option<ToolNamePrefixer>) -> ByteStream {
    let stream = async_stream::stream! {
        let mut inner = inner;
        let mut buffer = BytesMut::new();
        // bytes of `buffer` already known to hold no newline
        let mut scanned = 0;

        while let Some(chunk) = inner.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            buffer.extend_from_slice(&chunk);

            let mut out = Vec::new();
            while let Some(pos) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(scanned + pos + 1);
                scanned = 0;
                out.extend_from_slice(&unwrap_sse_line(&line, prefixer.as_ref()));
            }
            scanned = buffer.len();

            if buffer.len() > MAX_LINE_BUFFER {
                yield Err(TransportError::Stream("SSE line exceeded maximum size".to_string()));
                return;
            }

            if !out.is_empty() {
                yield Ok(Bytes::from(out));
            }
        }

        if !buffer.is_empty() {
            yield Ok(Bytes::from(unwrap_sse_line(&buffer, prefixer.as_ref())));
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn wrap_backend_response(inner: &Value) -> Vec<u8> {
        serde_json::to_vec(&json!({ "response": inner })).unwrap()
    }

    fn chunks<S: AsRef<str>>(parts: Vec<S>) -> ByteStream {
        Box::pin(stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, TransportError>(Bytes::copy_from_slice(p.as_ref().as_bytes())))
                .collect::<Vec<_>>(),
        ))
    }

    async fn collect(stream: ByteStream) -> (String, Option<TransportError>) {
        let mut stream = stream;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(bytes) => text.push_str(std::str::from_utf8(&bytes).unwrap()),
                Err(e) => return (text, Some(e)),
            }
        }
        (text, None)
    }

    #[test]
    fn test_unwrap_inverts_wrap() {
        let inner = json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]});
        let wrapped = wrap_backend_response(&inner);
        let Unwrapped::Inner(bytes) = unwrap_payload(&wrapped) else {
            panic!("expected envelope to unwrap");
        };
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), inner);
    }

    #[test]
    fn test_non_envelopes_pass_through() {
        assert_eq!(unwrap_payload(b"not json"), Unwrapped::Raw(b"not json"));
        let error = br#"{"error":{"code":400}}"#;
        assert_eq!(unwrap_payload(error), Unwrapped::Raw(&error[..]));
        assert_eq!(unwrap_payload(b"[1,2]"), Unwrapped::Raw(b"[1,2]"));
    }

    #[test]
    fn test_unwrap_body_restores_tool_names() {
        let prefixer = ToolNamePrefixer::default();
        let body = Bytes::from(wrap_backend_response(&json!({
            "candidates": [{"content": {"parts": [{"functionCall": {"name": "mcp_read_file"}}]}}]
        })));
        let unwrapped = unwrap_body(&body, Some(&prefixer));
        let value: Value = serde_json::from_slice(&unwrapped).unwrap();
        assert_eq!(
            value["candidates"][0]["content"]["parts"][0]["functionCall"]["name"],
            "read_file"
        );
    }

    #[test]
    fn test_sse_line_variants() {
        assert_eq!(
            unwrap_sse_line(b"data: {\"response\":{\"a\":1}}\r\n", None),
            b"data: {\"a\":1}\r\n".to_vec()
        );
        assert_eq!(unwrap_sse_line(b"data: [DONE]\n", None), b"data: [DONE]\n".to_vec());
        assert_eq!(unwrap_sse_line(b": keepalive\n", None), b": keepalive\n".to_vec());
        assert_eq!(unwrap_sse_line(b"\n", None), b"\n".to_vec());
        assert_eq!(
            unwrap_sse_line(b"data: {broken\n", None),
            b"data: {broken\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_stream_reassembles_split_lines() {
        let inner = chunks(vec![
            "data: {\"respo",
            "nse\":{\"functionCall\":{\"name\":\"mcp_read_file\"}}}\n\n",
            "data: [DONE]\n\n",
        ]);
        let (text, err) = collect(unwrap_stream(inner, Some(ToolNamePrefixer::default()))).await;
        assert!(err.is_none());
        assert_eq!(
            text,
            "data: {\"functionCall\":{\"name\":\"read_file\"}}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn test_stream_reassembles_line_from_many_small_chunks() {
        let line = "data: {\"response\":{\"text\":\"abcdefghij\"}}\n";
        let mut pieces: Vec<String> = line.chars().map(String::from).collect();
        pieces.push("data: [DONE]\n".to_string());
        let (text, err) = collect(unwrap_stream(chunks(pieces), None)).await;
        assert!(err.is_none());
        assert_eq!(text, "data: {\"text\":\"abcdefghij\"}\ndata: [DONE]\n");
    }

    #[tokio::test]
    async fn test_stream_flushes_unterminated_tail() {
        let inner = chunks(vec!["data: {\"response\":{\"done\":true}}"]);
        let (text, _) = collect(unwrap_stream(inner, None)).await;
        assert_eq!(text, "data: {\"done\":true}");
    }

    #[tokio::test]
    async fn test_stream_forwards_first_error_and_stops() {
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"response\":1}\n")),
            Err(TransportError::Stream("reset".into())),
            Ok(Bytes::from_static(b"data: {\"response\":2}\n")),
        ]));
        let (text, err) = collect(unwrap_stream(inner, None)).await;
        assert_eq!(text, "data: 1\n");
        assert!(matches!(err, Some(TransportError::Stream(_))));
    }

    #[tokio::test]
    async fn test_dropping_stream_drops_inner() {
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Guard(dropped.clone());
        let inner: ByteStream = Box::pin(
            stream::iter(vec![Ok(Bytes::from_static(b"data: {}\n"))])
                .chain(stream::pending())
                .map(move |item| {
                    let _guard = &guard;
                    item
                }),
        );

        let mut unwrapped = unwrap_stream(inner, None);
        assert!(unwrapped.next().await.is_some());
        assert!(!dropped.load(Ordering::SeqCst));
        drop(unwrapped);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
