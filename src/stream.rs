//! The typed answer event stream and its wire codec.
//!
//! Answers stream as `text/event-stream` blocks:
//!
//! ```text
//! event: text.delta
//! data: {"type":"text.delta","delta":"hello"}
//!
//! ```
//!
//! The JSON payload's own `type` field is the authoritative event
//! discriminator; the `event:` line is diagnostic only. The decoder is an
//! incremental state machine: network chunks arrive at arbitrary
//! boundaries, so it buffers an unconsumed tail across pushes and only
//! acts on fully `\n`-terminated lines. A line, or a whole block, may be
//! split across any number of chunks without changing the decoded result.

use std::collections::VecDeque;

use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// One event of a streaming answer.
///
/// Ordering invariant: `meta` first and exactly once, then zero or more
/// `text.delta` in emission order; the stream ends at the first `error`
/// or `done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "meta")]
    Meta {
        model: String,
        resources: Vec<String>,
        collection_key: String,
        collection_path: String,
    },
    #[serde(rename = "text.delta")]
    TextDelta { delta: String },
    #[serde(rename = "error")]
    Error {
        message: String,
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
    },
    #[serde(rename = "done")]
    Done,
}

impl StreamEvent {
    /// Wire name of this event's kind (the `event:` line value).
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Meta { .. } => "meta",
            StreamEvent::TextDelta { .. } => "text.delta",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }

    /// Whether the stream ends after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done)
    }
}

// ============ Encoder ============

/// Frame one event as a wire block.
///
/// The payload is a single `data:` line: serde_json escapes any embedded
/// newlines, so payload text can never produce a literal line break.
pub fn encode_block(event: &StreamEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| {
        // Unreachable for this enum; keep the stream well-formed anyway.
        r#"{"type":"error","message":"event serialization failed","tag":"encode_error"}"#
            .to_string()
    });
    format!("event: {}\ndata: {}\n\n", event.kind(), json)
}

/// Encode a produced event sequence as a lazy byte stream: the `meta`
/// block first, then one block per event, ending with the first terminal
/// event. No buffering beyond the event in hand — backpressure falls out
/// of `Stream` polling (nothing is framed until both the producer has
/// yielded and the transport polls).
pub fn encode<S>(meta: StreamEvent, events: S) -> impl Stream<Item = String>
where
    S: Stream<Item = StreamEvent>,
{
    let mut ended = false;
    stream::iter([meta])
        .chain(events)
        .take_while(move |event| {
            let keep = !ended;
            ended = ended || event.is_terminal();
            futures_util::future::ready(keep)
        })
        .map(|event| encode_block(&event))
}

// ============ Decoder ============

/// Incremental wire decoder.
///
/// Feed it raw chunks as they arrive; it returns every event completed by
/// that chunk. State is one unconsumed-tail buffer plus the current
/// block's `event:` type and latest `data:` line.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    event_type: Option<String>,
    data: Option<String>,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal event has been decoded; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume one chunk, returning the events it completed (possibly
    /// none: a chunk may end mid-line or mid-block).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.buf.extend_from_slice(chunk);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            self.handle_line(&line, &mut out);
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }

        if line.is_empty() {
            // Blank line: the current block is complete.
            if let Some(event) = self.complete_block() {
                if event.is_terminal() {
                    self.finished = true;
                }
                out.push(event);
            }
            self.event_type = None;
            return;
        }

        if let Some(kind) = line.strip_prefix("event: ") {
            self.event_type = Some(kind.to_string());
        } else if let Some(payload) = line.strip_prefix("data: ") {
            // Last data line wins within a block.
            self.data = Some(payload.to_string());
        }
        // Anything else (comments, keepalives) is ignored.
    }

    /// Decode the pending `data:` payload. The JSON `type` field decides
    /// the variant; a malformed payload becomes a synthetic decode error
    /// and decoding continues with the next block.
    fn complete_block(&mut self) -> Option<StreamEvent> {
        let payload = self.data.take()?;
        match serde_json::from_str::<StreamEvent>(&payload) {
            Ok(event) => Some(event),
            Err(e) => Some(StreamEvent::Error {
                message: format!(
                    "malformed event payload in '{}' block: {}",
                    self.event_type.as_deref().unwrap_or("unknown"),
                    e
                ),
                tag: "decode_error".to_string(),
                hint: None,
            }),
        }
    }
}

/// Decode a one-shot byte-chunk stream into events. Tied to the single
/// consumption of its source: it is not restartable. A transport error
/// surfaces as a final synthetic `error` event.
pub fn decode_stream<S, B, E>(source: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = (source, StreamDecoder::new(), VecDeque::new(), false);
    stream::unfold(state, |(mut source, mut decoder, mut pending, mut ended)| async move {
        loop {
            if let Some(event) = pending.pop_front() {
                return Some((event, (source, decoder, pending, ended)));
            }
            if ended {
                return None;
            }
            match source.next().await {
                Some(Ok(chunk)) => pending.extend(decoder.push(chunk.as_ref())),
                Some(Err(e)) => {
                    ended = true;
                    if !decoder.is_finished() {
                        pending.push_back(StreamEvent::Error {
                            message: format!("transport error: {}", e),
                            tag: "transport_error".to_string(),
                            hint: None,
                        });
                    }
                }
                None => ended = true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> StreamEvent {
        StreamEvent::Meta {
            model: "gpt-4o-mini".into(),
            resources: vec!["svelte".into()],
            collection_key: "abcd1234abcd1234".into(),
            collection_path: "/data/collections/abcd1234abcd1234".into(),
        }
    }

    fn delta(s: &str) -> StreamEvent {
        StreamEvent::TextDelta { delta: s.into() }
    }

    #[test]
    fn block_format() {
        let block = encode_block(&delta("hello"));
        assert_eq!(
            block,
            "event: text.delta\ndata: {\"type\":\"text.delta\",\"delta\":\"hello\"}\n\n"
        );
    }

    #[test]
    fn payload_newlines_stay_on_one_data_line() {
        let block = encode_block(&delta("line one\nline two"));
        // One event line, one data line, one terminating blank line.
        assert_eq!(block.matches('\n').count(), 3);
        assert!(block.contains("\\n"));
    }

    #[test]
    fn three_chunk_block_decodes_to_one_event() {
        let mut dec = StreamDecoder::new();
        assert!(dec.push(b"event: text.delta\n").is_empty());
        assert!(dec
            .push(b"data: {\"type\":\"text.delta\",\"delta\":\"hello\"}\n")
            .is_empty());
        let events = dec.push(b"\n");
        assert_eq!(events, vec![delta("hello")]);
    }

    #[test]
    fn data_line_split_mid_payload() {
        let mut dec = StreamDecoder::new();
        assert!(dec.push(b"data: {\"type\":\"text.delta\",\"de").is_empty());
        let events = dec.push(b"lta\":\"split\"}\n\n");
        assert_eq!(events, vec![delta("split")]);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let wire = encode_block(&meta()) + &encode_block(&delta("hi")) + &encode_block(&StreamEvent::Done);
        let mut dec = StreamDecoder::new();
        let mut events = Vec::new();
        for b in wire.as_bytes() {
            events.extend(dec.push(&[*b]));
        }
        assert_eq!(events, vec![meta(), delta("hi"), StreamEvent::Done]);
    }

    #[test]
    fn full_stream_order_preserved_and_ends_at_done() {
        let wire = [
            encode_block(&meta()),
            encode_block(&delta("a")),
            encode_block(&delta("b")),
            encode_block(&StreamEvent::Done),
            // Trailing garbage after the terminal block must be ignored.
            encode_block(&delta("never")),
        ]
        .concat();

        let mut dec = StreamDecoder::new();
        let events = dec.push(wire.as_bytes());
        assert_eq!(
            events,
            vec![meta(), delta("a"), delta("b"), StreamEvent::Done]
        );
        assert!(dec.is_finished());
    }

    #[test]
    fn payload_type_field_wins_over_event_line() {
        let mut dec = StreamDecoder::new();
        let events = dec.push(
            b"event: text.delta\ndata: {\"type\":\"done\"}\n\n",
        );
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn malformed_payload_becomes_decode_error_and_decoding_continues() {
        let mut dec = StreamDecoder::new();
        let mut events = dec.push(b"event: text.delta\ndata: {not json\n\n");
        events.extend(dec.push(b"data: {\"type\":\"text.delta\",\"delta\":\"ok\"}\n\n"));

        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Error { tag, message, .. } => {
                assert_eq!(tag, "decode_error");
                assert!(message.contains("text.delta"));
            }
            other => panic!("expected decode error, got {:?}", other),
        }
        assert_eq!(events[1], delta("ok"));
    }

    #[test]
    fn crlf_lines_tolerated() {
        let mut dec = StreamDecoder::new();
        let events =
            dec.push(b"event: done\r\ndata: {\"type\":\"done\"}\r\n\r\n");
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn blank_line_without_data_emits_nothing() {
        let mut dec = StreamDecoder::new();
        assert!(dec.push(b"\n\n\n").is_empty());
        assert!(dec.push(b": keepalive comment\n\n").is_empty());
    }

    #[test]
    fn error_event_round_trips_with_hint() {
        let event = StreamEvent::Error {
            message: "upstream failed".into(),
            tag: "upstream".into(),
            hint: Some("try again later".into()),
        };
        let mut dec = StreamDecoder::new();
        let events = dec.push(encode_block(&event).as_bytes());
        assert_eq!(events, vec![event]);
        assert!(dec.is_finished());
    }

    #[tokio::test]
    async fn encode_emits_meta_first_and_stops_at_terminal() {
        let events = stream::iter(vec![delta("a"), StreamEvent::Done, delta("after")]);
        let blocks: Vec<String> = encode(meta(), events).collect().await;

        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].starts_with("event: meta\n"));
        assert!(blocks[1].contains("\"delta\":\"a\""));
        assert!(blocks[2].starts_with("event: done\n"));
    }

    #[tokio::test]
    async fn decode_stream_reassembles_arbitrary_chunking() {
        let wire = [
            encode_block(&meta()),
            encode_block(&delta("hello ")),
            encode_block(&delta("world")),
            encode_block(&StreamEvent::Done),
        ]
        .concat();

        // Split at awkward places: mid-line, mid-JSON, empty chunk.
        let bytes = wire.as_bytes();
        let chunks: Vec<Result<&[u8], std::convert::Infallible>> = vec![
            Ok(&bytes[..9]),
            Ok(&bytes[9..10]),
            Ok(&[]),
            Ok(&bytes[10..47]),
            Ok(&bytes[47..]),
        ];
        let events: Vec<StreamEvent> =
            decode_stream(stream::iter(chunks)).collect().await;

        assert_eq!(
            events,
            vec![meta(), delta("hello "), delta("world"), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn encode_then_decode_is_lossless_across_one_byte_chunks() {
        let produced = vec![delta("a"), delta("b"), StreamEvent::Done];
        let blocks: Vec<String> = encode(meta(), stream::iter(produced)).collect().await;
        let wire = blocks.concat();

        let chunks: Vec<Result<Vec<u8>, std::convert::Infallible>> =
            wire.as_bytes().iter().map(|b| Ok(vec![*b])).collect();
        let events: Vec<StreamEvent> =
            decode_stream(stream::iter(chunks)).collect().await;

        assert_eq!(
            events,
            vec![meta(), delta("a"), delta("b"), StreamEvent::Done]
        );
    }
}
