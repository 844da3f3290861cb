//! # Balanced-Brace Framing
//!
//! TLC-FI sends bare JSON objects back to back on the TCP stream, with no
//! length prefix or delimiter. A frame ends where its outermost `{` closes.
//!
//! ```text
//! bytes:  {"a":"}"}  {"b":{"c":1}}{"d":"\"{"}
//!         └────────┘ └────────────┘└─────────┘
//!           frame 1      frame 2     frame 3
//! ```
//!
//! Braces inside string literals (and escaped quotes) do not count.

use crate::error::{ClientError, ClientResult};

/// Upper bound for a single frame.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Incremental frame splitter. Feed it whatever the socket returns.
#[derive(Debug, Default)]
pub struct BraceFramer {
    buffer: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl BraceFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `chunk` and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> ClientResult<Vec<String>> {
        let mut frames = Vec::new();

        for &byte in chunk {
            if self.depth == 0 {
                // Between frames only whitespace is expected; skip the rest.
                if byte == b'{' {
                    self.depth = 1;
                    self.buffer.push(byte);
                }
                continue;
            }

            self.buffer.push(byte);
            if self.buffer.len() > MAX_FRAME_LEN {
                self.reset();
                return Err(ClientError::InvalidMessage(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_LEN
                )));
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let bytes = std::mem::take(&mut self.buffer);
                        let frame = String::from_utf8(bytes).map_err(|e| {
                            ClientError::InvalidMessage(format!("frame is not UTF-8: {}", e))
                        })?;
                        frames.push(frame);
                    }
                }
                _ => {}
            }
        }

        Ok(frames)
    }

    /// True while a frame is partially buffered.
    pub fn has_partial(&self) -> bool {
        self.depth > 0
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame() {
        let mut framer = BraceFramer::new();
        let frames = framer.push(br#"{"jsonrpc":"2.0","id":1}"#).unwrap();
        assert_eq!(frames, vec![r#"{"jsonrpc":"2.0","id":1}"#.to_string()]);
        assert!(!framer.has_partial());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut framer = BraceFramer::new();
        assert!(framer.push(br#"{"a":{"b""#).unwrap().is_empty());
        assert!(framer.has_partial());
        let frames = framer.push(br#":1}}"#).unwrap();
        assert_eq!(frames, vec![r#"{"a":{"b":1}}"#.to_string()]);
    }

    #[test]
    fn test_braces_inside_strings() {
        let mut framer = BraceFramer::new();
        let frames = framer.push(br#"{"a":"}{"}"#).unwrap();
        assert_eq!(frames, vec![r#"{"a":"}{"}"#.to_string()]);
    }

    #[test]
    fn test_escaped_quotes() {
        let mut framer = BraceFramer::new();
        let frames = framer.push(br#"{"a":"x\"}"}{"b":"\\"}"#).unwrap();
        assert_eq!(
            frames,
            vec![r#"{"a":"x\"}"}"#.to_string(), r#"{"b":"\\"}"#.to_string()]
        );
    }

    #[test]
    fn test_multiple_frames_with_whitespace() {
        let mut framer = BraceFramer::new();
        let frames = framer.push(b"{\"a\":1}\r\n  {\"b\":2}\n{").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], "{\"b\":2}");
        assert!(framer.has_partial());
    }
}
