//! Reassembles JSON documents from a backend's stdout byte stream.
//!
//! MCP stdio servers are supposed to emit one JSON object per line, but in
//! practice messages arrive split across reads, pretty-printed over several
//! lines, or interleaved with log output. [`JsonFrameCodec`] scans for a
//! complete top-level object (string and escape aware), skips lines that
//! cannot start one, and fails once a single frame outgrows its bound.

use serde_json::Value;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::TransportError;

/// Largest single message accepted from a backend.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
struct ScanState {
    /// Bytes of the current frame already scanned.
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

#[derive(Debug)]
pub struct JsonFrameCodec {
    max_frame: usize,
    scan: Option<ScanState>,
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }
}

impl JsonFrameCodec {
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            max_frame,
            scan: None,
        }
    }

    /// True while a frame has started but not yet closed.
    pub fn in_frame(&self) -> bool {
        self.scan.is_some()
    }

    /// Drops whitespace and non-JSON noise lines ahead of the next frame.
    /// Returns false when more input is needed.
    fn seek_frame_start(&mut self, src: &mut BytesMut) -> Result<bool, TransportError> {
        loop {
            let skip = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            src.advance(skip);

            match src.first().copied() {
                None => return Ok(false),
                Some(b'{') => {
                    self.scan = Some(ScanState::default());
                    return Ok(true);
                }
                Some(_) => match src.iter().position(|b| *b == b'\n') {
                    Some(newline) => {
                        let noise = src.split_to(newline + 1);
                        tracing::debug!(
                            line = %String::from_utf8_lossy(&noise).trim_end(),
                            "skipping non-JSON output from backend"
                        );
                    }
                    None if src.len() > self.max_frame => {
                        return Err(TransportError::Framing(format!(
                            "unterminated non-JSON output exceeded {} bytes",
                            self.max_frame
                        )));
                    }
                    None => return Ok(false),
                },
            }
        }
    }
}

impl Decoder for JsonFrameCodec {
    type Item = Value;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, TransportError> {
        loop {
            if self.scan.is_none() && !self.seek_frame_start(src)? {
                return Ok(None);
            }
            let Some(state) = self.scan.as_mut() else {
                return Ok(None);
            };

            let mut end = None;
            for (i, byte) in src.iter().enumerate().skip(state.offset) {
                if state.in_string {
                    match (state.escaped, *byte) {
                        (true, _) => state.escaped = false,
                        (false, b'\\') => state.escaped = true,
                        (false, b'"') => state.in_string = false,
                        _ => {}
                    }
                    continue;
                }
                match byte {
                    b'"' => state.in_string = true,
                    b'{' | b'[' => state.depth += 1,
                    b'}' | b']' => {
                        state.depth = state.depth.saturating_sub(1);
                        if state.depth == 0 {
                            end = Some(i + 1);
                            break;
                        }
                    }
                    _ => {}
                }
            }

            let Some(end) = end else {
                state.offset = src.len();
                if src.len() > self.max_frame {
                    return Err(TransportError::Framing(format!(
                        "incomplete JSON frame exceeded {} bytes",
                        self.max_frame
                    )));
                }
                return Ok(None);
            };

            self.scan = None;
            let frame = src.split_to(end);
            match serde_json::from_slice::<Value>(&frame) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(error = %e, bytes = frame.len(), "discarding malformed JSON frame");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, TransportError> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        if !src.is_empty() {
            tracing::debug!(bytes = src.len(), "dropping partial output at end of stream");
            src.clear();
            self.scan = None;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(codec: &mut JsonFrameCodec, buf: &mut BytesMut, bytes: &str) -> Vec<Value> {
        buf.extend_from_slice(bytes.as_bytes());
        let mut out = Vec::new();
        while let Some(v) = codec.decode(buf).unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn reassembles_split_frames() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();

        assert!(feed(&mut codec, &mut buf, r#"{"jsonrpc":"2.0","id":1,"res"#).is_empty());
        let frames = feed(&mut codec, &mut buf, "ult\":{\"ok\":true}}\n");
        assert_eq!(frames, vec![json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})]);
    }

    #[test]
    fn yields_several_frames_from_one_read() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();
        let frames = feed(&mut codec, &mut buf, "{\"id\":1}\n{\"id\":2}{\"id\":3}\n");
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2]["id"], 3);
    }

    #[test]
    fn braces_inside_strings_do_not_close_frames() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();
        let frames = feed(&mut codec, &mut buf, r#"{"text":"a } \" { b","n":[1,{"x":"]"}]}"#);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["text"], "a } \" { b");
    }

    #[test]
    fn skips_log_noise_between_frames() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();
        let frames = feed(
            &mut codec,
            &mut buf,
            "[INFO] server starting\nready.\n{\"id\":7}\nWARN late\n",
        );
        assert_eq!(frames, vec![json!({"id": 7})]);
        assert!(buf.is_empty());
    }

    #[test]
    fn pretty_printed_frames_are_accepted() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();
        let frames = feed(&mut codec, &mut buf, "{\n  \"id\": 1,\n  \"result\": {}\n}\n");
        assert_eq!(frames, vec![json!({"id": 1, "result": {}})]);
    }

    #[test]
    fn oversized_frame_is_a_framing_error() {
        let mut codec = JsonFrameCodec::with_max_frame(16);
        let mut buf = BytesMut::from(&br#"{"data":"0123456789abcdef"#[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::Framing(_)));
    }

    #[test]
    fn in_frame_tracks_partial_frames_only() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();

        assert!(feed(&mut codec, &mut buf, "[log] partial noise").is_empty());
        assert!(!codec.in_frame());

        assert!(feed(&mut codec, &mut buf, "\n{\"id\":").is_empty());
        assert!(codec.in_frame());

        assert_eq!(feed(&mut codec, &mut buf, "1}\n").len(), 1);
        assert!(!codec.in_frame());
        // The line terminator stays buffered until the next read.
        assert_eq!(&buf[..], b"\n");
    }

    #[test]
    fn malformed_frame_is_skipped() {
        let mut codec = JsonFrameCodec::default();
        let mut buf = BytesMut::new();
        let frames = feed(&mut codec, &mut buf, "{not json}\n{\"id\":2}\n");
        assert_eq!(frames, vec![json!({"id": 2})]);
    }
}
