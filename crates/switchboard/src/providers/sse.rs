use std::collections::BTreeMap;

use futures::StreamExt;

use super::base::ByteStream;
use crate::errors::ProviderError;
use crate::models::delta::{Delta, DeltaStream};

/// A single server sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental server sent event framing. Bytes are buffered until a blank
/// line completes an event, so multi-byte characters split across network
/// chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some((end, separator_len)) = find_event_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + separator_len).collect();
            if let Some(event) = parse_event(&raw[..end]) {
                events.push(event);
            }
        }

        events
    }

    /// Flush whatever remains once the byte stream has ended
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buffer);
        parse_event(&raw)
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

fn parse_event(raw: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Vendor specific interpretation of decoded events.
pub trait StreamParser: Send + 'static {
    fn provider(&self) -> &str;

    /// Deltas produced by one event. A terminal delta ends the stream.
    fn on_event(&mut self, event: SseEvent) -> Vec<Delta>;

    /// Deltas to emit when the byte stream ends without a terminal delta
    fn on_eof(&mut self) -> Vec<Delta>;

    /// Deltas to emit when the byte stream fails mid-flight
    fn on_transport_error(&mut self, error: ProviderError) -> Vec<Delta>;
}

/// Run a parser over a raw byte stream, stopping after the first terminal delta.
pub fn drive<P: StreamParser>(mut parser: P, mut raw: ByteStream) -> DeltaStream {
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = raw.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        for delta in parser.on_event(event) {
                            let terminal = delta.is_terminal();
                            yield delta;
                            if terminal {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(provider = parser.provider(), error = %error, "stream failed mid-flight");
                    for delta in parser.on_transport_error(error) {
                        yield delta;
                    }
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            for delta in parser.on_event(event) {
                let terminal = delta.is_terminal();
                yield delta;
                if terminal {
                    return;
                }
            }
        }

        for delta in parser.on_eof() {
            yield delta;
        }
    })
}

/// Tool calls that have been started but not yet ended, keyed by index
#[derive(Debug, Default)]
pub struct OpenToolCalls {
    open: BTreeMap<usize, String>,
}

impl OpenToolCalls {
    pub fn open(&mut self, index: usize, id: &str) {
        self.open.insert(index, id.to_string());
    }

    pub fn is_open(&self, index: usize) -> bool {
        self.open.contains_key(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn close(&mut self, index: usize) -> Option<Delta> {
        self.open.remove(&index).map(|_| Delta::ToolCallEnd {
            index,
            truncated: false,
        })
    }

    /// Close every open call, in index order
    pub fn close_all(&mut self, truncated: bool) -> Vec<Delta> {
        std::mem::take(&mut self.open)
            .into_keys()
            .map(|index| Delta::ToolCallEnd { index, truncated })
            .collect()
    }

    /// The deltas ending a stream that stopped early: every open call is
    /// marked truncated, followed by a single error.
    pub fn truncate(&mut self, error: ProviderError) -> Vec<Delta> {
        let mut deltas = self.close_all(true);
        deltas.push(Delta::error(error));
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: ping\ndata: {}\n\ndata: one\ndata: two\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: Some("ping".to_string()),
                    data: "{}".to_string()
                },
                SseEvent {
                    event: None,
                    data: "one\ntwo".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_decoder_buffers_partial_events() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: hel").is_empty());
        let events = decoder.push(b"lo\n\n");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_decoder_reassembles_split_utf8() {
        let bytes = "data: héllo\n\n".as_bytes();
        // split inside the two byte 'é'
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;

        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let events = decoder.push(&bytes[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_decoder_handles_crlf_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\r\n\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_decoder_finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "[DONE]");
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_open_tool_calls_truncate() {
        let mut calls = OpenToolCalls::default();
        calls.open(1, "b");
        calls.open(0, "a");
        let deltas = calls.truncate(ProviderError::truncated("openai"));
        assert_eq!(
            deltas[..2],
            [
                Delta::ToolCallEnd {
                    index: 0,
                    truncated: true
                },
                Delta::ToolCallEnd {
                    index: 1,
                    truncated: true
                },
            ]
        );
        assert!(matches!(deltas[2], Delta::Error { .. }));
        assert!(calls.is_empty());
    }
}
