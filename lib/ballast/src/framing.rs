use crate::support::{Framing, FramingFactory, Status};
use serde_json::Value;
use std::sync::Arc;

/// Streaming splitter for concatenated JSON documents.
///
/// The wire carries documents back to back with no delimiters; a document is
/// complete exactly when its brace/bracket nesting returns to depth zero
/// outside a string literal. The scanner state survives across calls, so the
/// stream may be fed in arbitrary chunks.
pub struct JsonFraming {
    // Scan position in the current in-buffer.
    cur: usize,
    // Offset where the currently open top-level document began.
    begin: usize,
    // Open delimiters, innermost last.
    stack: Vec<u8>,
    in_string: bool,
}

impl JsonFraming {
    pub fn new() -> JsonFraming {
        JsonFraming {
            cur: 0,
            begin: 0,
            stack: Vec::new(),
            in_string: false,
        }
    }

    /// Default factory handed to the multiplexer.
    pub fn factory() -> FramingFactory {
        Arc::new(|| Box::new(JsonFraming::new()) as Box<dyn Framing>)
    }

    fn reset(&mut self) {
        self.cur = 0;
        self.begin = 0;
        self.stack.clear();
        self.in_string = false;
    }

    fn garbage(&mut self, len: usize) -> (Status, Vec<Value>, usize) {
        self.reset();
        (Status::Garbage, Vec::new(), len)
    }
}

impl Framing for JsonFraming {
    fn decode(&mut self, buf: &[u8]) -> (Status, Vec<Value>, usize) {
        let mut raw_docs: Vec<(usize, usize)> = Vec::new();
        let mut consumed = 0;

        while self.cur < buf.len() {
            let byte = buf[self.cur];

            if self.in_string {
                match byte {
                    // The escaped byte may not have arrived yet; the cursor
                    // simply ends up past the buffer and picks it up on the
                    // next feed.
                    b'\\' => self.cur += 1,
                    b'"' => self.in_string = false,
                    _ => (),
                }
            } else {
                match byte {
                    b'{' | b'[' => {
                        if self.stack.is_empty() {
                            self.begin = self.cur;
                        }
                        self.stack.push(byte);
                    }
                    b'}' | b']' => {
                        let opener = match self.stack.pop() {
                            Some(opener) => opener,
                            None => return self.garbage(buf.len()),
                        };
                        let expected = if opener == b'{' { b'}' } else { b']' };
                        if byte != expected {
                            return self.garbage(buf.len());
                        }
                        if self.stack.is_empty() {
                            raw_docs.push((self.begin, self.cur + 1));
                            consumed = self.cur + 1;
                        }
                    }
                    b'"' => self.in_string = true,
                    _ => (),
                }
            }

            self.cur += 1;
        }

        // Rebase the carried state past the bytes the caller will drop.
        self.cur -= consumed;
        if self.stack.is_empty() {
            self.begin = 0;
        } else {
            self.begin -= consumed;
        }

        let mut docs = Vec::with_capacity(raw_docs.len());
        for (start, end) in raw_docs {
            match serde_json::from_slice(&buf[start..end]) {
                Ok(doc) => docs.push(doc),
                Err(_) => return self.garbage(buf.len()),
            }
        }

        if docs.is_empty() {
            (Status::Undefined, docs, consumed)
        } else {
            (Status::Ok, docs, consumed)
        }
    }

    fn encode(&mut self, doc: &Value) -> Vec<u8> {
        // Trailing newline is a readability aid only; the receiving parser
        // skips bytes between documents.
        let mut bytes = serde_json::to_vec(doc).expect("JSON value must serialise");
        bytes.push(b'\n');
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Feed a chunk through a parser over a persistent buffer, applying the
    /// compaction the multiplexer would.
    fn feed(parser: &mut JsonFraming, buffer: &mut Vec<u8>, chunk: &[u8]) -> (Status, Vec<Value>) {
        buffer.extend_from_slice(chunk);
        let (status, docs, consumed) = parser.decode(buffer);
        buffer.drain(..consumed);
        (status, docs)
    }

    #[test]
    fn test_simple() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, b"{}");

        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!({})]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_two_docs() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, b"{}[]");

        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!({}), json!([])]);
    }

    #[test]
    fn test_erroneous() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, b"{]");

        assert_eq!(status, Status::Garbage);
        assert!(docs.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_close_on_empty_stack() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, _) = feed(&mut parser, &mut buffer, b"]");

        assert_eq!(status, Status::Garbage);
    }

    #[test]
    fn test_partial() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, b"{}[");
        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!({})]);

        let (status, docs) = feed(&mut parser, &mut buffer, b"]");
        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!([])]);
    }

    #[test]
    fn test_delimiters_inside_strings() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(
            &mut parser,
            &mut buffer,
            br#"{"one": 1, "two": 2, "3": "}]}", "5": "bla"} ["#,
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!({"one": 1, "two": 2, "3": "}]}", "5": "bla"})]);

        let (status, docs) = feed(&mut parser, &mut buffer, b"2, 3, 4]");
        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!([2, 3, 4])]);
    }

    #[test]
    fn test_void() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, b"");

        assert_eq!(status, Status::Undefined);
        assert!(docs.is_empty());
    }

    #[test]
    fn test_incomplete_is_undefined() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, br#"{"open": ["#);

        assert_eq!(status, Status::Undefined);
        assert!(docs.is_empty());
        assert_eq!(buffer.len(), 10);
    }

    #[test]
    fn test_bad_json_in_balanced_doc() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, docs) = feed(&mut parser, &mut buffer, br#"{"a":}"#);

        assert_eq!(status, Status::Garbage);
        assert!(docs.is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, _) = feed(&mut parser, &mut buffer, br#"{"a": "\"#);
        assert_eq!(status, Status::Undefined);

        let (status, docs) = feed(&mut parser, &mut buffer, br#"""}"#);
        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!({"a": "\""})]);
    }

    #[test]
    fn test_chunking_is_equivalent_to_single_feed() {
        let payload = br#"{"id": "1", "request": "status"} [1, [2, {"x": "]["}]] {"nested": {"deep": [true, null]}}"#;

        let mut single = JsonFraming::new();
        let mut buffer = Vec::new();
        let (status, expected) = feed(&mut single, &mut buffer, payload);
        assert_eq!(status, Status::Ok);
        assert_eq!(expected.len(), 3);

        for chunk_size in &[1usize, 2, 3, 7, 16] {
            let mut parser = JsonFraming::new();
            let mut buffer = Vec::new();
            let mut collected = Vec::new();

            for chunk in payload.chunks(*chunk_size) {
                let (status, mut docs) = feed(&mut parser, &mut buffer, chunk);
                assert_ne!(status, Status::Garbage);
                collected.append(&mut docs);
            }

            assert_eq!(collected, expected);
        }
    }

    #[test]
    fn test_parser_recovers_after_garbage() {
        let mut parser = JsonFraming::new();
        let mut buffer = Vec::new();

        let (status, _) = feed(&mut parser, &mut buffer, b"{]");
        assert_eq!(status, Status::Garbage);

        let (status, docs) = feed(&mut parser, &mut buffer, br#"{"ok": true}"#);
        assert_eq!(status, Status::Ok);
        assert_eq!(docs, vec![json!({"ok": true})]);
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut parser = JsonFraming::new();
        let bytes = parser.encode(&json!({"id": "1", "status": "ok"}));

        assert_eq!(bytes.last(), Some(&b'\n'));
        let doc: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(doc, json!({"id": "1", "status": "ok"}));
    }
}
