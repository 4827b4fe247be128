//! Streaming pseudonym reversal
//!
//! Model output arrives as SSE deltas that can split a pseudonym at any
//! byte. The reverser buffers delta text and only releases the prefix that
//! cannot be the start of a pseudonym: the held-back tail is the longest
//! buffer suffix that is a proper prefix of some known pseudonym, so it is
//! always shorter than the longest pseudonym.

use crate::protocol::ProtocolAdapter;
use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

pub struct HoldbackReverser {
    /// pseudonym -> original, longest pseudonym first.
    pairs: Vec<(String, String)>,
    max_pseudonym_len: usize,
    buffer: String,
}

impl HoldbackReverser {
    pub fn new(reverse_map: HashMap<String, String>) -> Self {
        let mut pairs: Vec<(String, String)> = reverse_map.into_iter().collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        let max_pseudonym_len = pairs.first().map(|(p, _)| p.len()).unwrap_or(0);

        Self {
            pairs,
            max_pseudonym_len,
            buffer: String::new(),
        }
    }

    /// Absorb a delta and return the text that is safe to emit now.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.buffer.push_str(chunk);
        self.substitute();

        let hold = self.holdback_len();
        let release_at = self.buffer.len() - hold;
        let released: String = self.buffer.drain(..release_at).collect();
        released
    }

    /// Drain everything at end of stream. Any held-back partial match was a
    /// coincidence and goes out as-is.
    pub fn flush(&mut self) -> String {
        self.substitute();
        std::mem::take(&mut self.buffer)
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn substitute(&mut self) {
        for (pseudonym, original) in &self.pairs {
            if self.buffer.contains(pseudonym.as_str()) {
                self.buffer = self.buffer.replace(pseudonym.as_str(), original);
            }
        }
    }

    /// Length of the longest buffer suffix that is a proper prefix of some
    /// pseudonym. Cut points land on char boundaries only.
    fn holdback_len(&self) -> usize {
        if self.max_pseudonym_len == 0 {
            return 0;
        }

        let buf = self.buffer.as_str();
        let limit = self.max_pseudonym_len.saturating_sub(1).min(buf.len());

        for len in (1..=limit).rev() {
            let start = buf.len() - len;
            if !buf.is_char_boundary(start) {
                continue;
            }
            let suffix = &buf[start..];
            if self
                .pairs
                .iter()
                .any(|(p, _)| p.len() > suffix.len() && p.starts_with(suffix))
            {
                return len;
            }
        }
        0
    }
}

/// Rewrites one SSE stream: delta text goes through the holdback reverser,
/// every other line passes through untouched. Feed raw bytes in; lines are
/// reassembled across chunk boundaries.
pub struct StreamTransform {
    adapter: Box<dyn ProtocolAdapter>,
    reverser: HoldbackReverser,
    pending: Vec<u8>,
    /// Last delta line seen, used as the template for the final flush.
    last_delta_line: Option<String>,
}

impl StreamTransform {
    pub fn new(adapter: Box<dyn ProtocolAdapter>, reverse_map: HashMap<String, String>) -> Self {
        Self {
            adapter,
            reverser: HoldbackReverser::new(reverse_map),
            pending: Vec::new(),
            last_delta_line: None,
        }
    }

    /// Process one upstream chunk and return the bytes to forward.
    pub fn transform_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(chunk);

        let mut output = Vec::new();
        while let Some(newline_at) = self.pending.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.pending.drain(..=newline_at).collect();
            self.process_line(&line_bytes, &mut output)?;
        }
        Ok(output)
    }

    /// Flush at end of stream: any incomplete line plus held-back text.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let mut output = Vec::new();

        if !self.pending.is_empty() {
            let line_bytes = std::mem::take(&mut self.pending);
            self.process_line(&line_bytes, &mut output)?;
        }
        self.emit_holdback(&mut output)?;
        Ok(output)
    }

    fn process_line(&mut self, line_bytes: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let Ok(raw) = std::str::from_utf8(line_bytes) else {
            output.extend_from_slice(line_bytes);
            return Ok(());
        };
        let line = raw.trim_end_matches(['\n', '\r']);

        if self.adapter.is_stream_end(line) || self.adapter.is_flush_point(line) {
            // Everything held back must precede the frame that closes the
            // current text.
            self.emit_holdback(output)?;
            output.extend_from_slice(line_bytes);
            return Ok(());
        }

        if let Some(text) = self.adapter.parse_delta(line) {
            self.last_delta_line = Some(line.to_string());
            let released = self.reverser.feed(&text);
            let rewritten = self.adapter.rewrite_delta(line, &released)?;
            output.extend_from_slice(rewritten.as_bytes());
            output.push(b'\n');

            debug!(
                released = released.len(),
                held = self.reverser.pending_len(),
                "Transformed stream delta"
            );
            return Ok(());
        }

        output.extend_from_slice(line_bytes);
        Ok(())
    }

    fn emit_holdback(&mut self, output: &mut Vec<u8>) -> Result<()> {
        let remainder = self.reverser.flush();
        if remainder.is_empty() {
            return Ok(());
        }
        if let Some(template) = &self.last_delta_line {
            let line = self.adapter.rewrite_delta(template, &remainder)?;
            output.extend_from_slice(line.as_bytes());
            output.push(b'\n');
        } else {
            // No delta line ever arrived to use as a template; nothing was
            // buffered from deltas either, so this cannot normally happen.
            output.extend_from_slice(remainder.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{adapter_for, Protocol};

    fn reverse_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(p, o)| (p.to_string(), o.to_string()))
            .collect()
    }

    #[test]
    fn test_whole_pseudonym_in_one_chunk() {
        let mut r = HoldbackReverser::new(reverse_map(&[("James Mitchell", "John Smith")]));

        let out = r.feed("Dear James Mitchell, hello");
        assert_eq!(out, "Dear John Smith, hello");
        assert_eq!(r.flush(), "");
    }

    #[test]
    fn test_pseudonym_split_across_chunks() {
        let mut r = HoldbackReverser::new(reverse_map(&[("James Mitchell", "John Smith")]));

        let mut out = r.feed("Dear James Mit");
        out.push_str(&r.feed("chell, hello"));
        out.push_str(&r.flush());

        assert_eq!(out, "Dear John Smith, hello");
    }

    #[test]
    fn test_every_split_point_is_safe() {
        let pseudonym = "James Mitchell";
        let text = format!("Dear {}, regards", pseudonym);

        for split in 1..text.len() {
            let mut r = HoldbackReverser::new(reverse_map(&[(pseudonym, "John Smith")]));
            let mut out = r.feed(&text[..split]);
            out.push_str(&r.feed(&text[split..]));
            out.push_str(&r.flush());
            assert_eq!(out, "Dear John Smith, regards", "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut r = HoldbackReverser::new(reverse_map(&[("James Mitchell", "John Smith")]));
        let text = "To James Mitchell.";

        let mut out = String::new();
        for c in text.chars() {
            out.push_str(&r.feed(&c.to_string()));
        }
        out.push_str(&r.flush());
        assert_eq!(out, "To John Smith.");
    }

    #[test]
    fn test_false_prefix_released_at_flush() {
        let mut r = HoldbackReverser::new(reverse_map(&[("James Mitchell", "John Smith")]));

        // "James Mit" then end of stream: never completes the pseudonym.
        let out = r.feed("Call James Mit");
        let rest = r.flush();
        assert_eq!(format!("{}{}", out, rest), "Call James Mit");
    }

    #[test]
    fn test_holdback_bounded() {
        let pseudonym = "James Mitchell";
        let mut r = HoldbackReverser::new(reverse_map(&[(pseudonym, "John Smith")]));

        r.feed("xxxxxxJames Mitchel");
        assert!(r.pending_len() < pseudonym.len());
    }

    #[test]
    fn test_multiple_pseudonyms() {
        let mut r = HoldbackReverser::new(reverse_map(&[
            ("James Mitchell", "John Smith"),
            ("Keystone Analytics", "Meridian Holdings"),
        ]));

        let mut out = r.feed("James Mitchell of Keystone Analy");
        out.push_str(&r.feed("tics called"));
        out.push_str(&r.flush());

        assert_eq!(out, "John Smith of Meridian Holdings called");
    }

    #[test]
    fn test_empty_map_passes_through() {
        let mut r = HoldbackReverser::new(HashMap::new());
        assert_eq!(r.feed("anything at all"), "anything at all");
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn test_multibyte_text_near_boundary() {
        let mut r = HoldbackReverser::new(reverse_map(&[("James Mitchell", "John Smith")]));
        let mut out = r.feed("café J");
        out.push_str(&r.feed("ames Mitchell ☕"));
        out.push_str(&r.flush());
        assert_eq!(out, "café John Smith ☕");
    }

    fn openai_delta(text: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}},\"index\":0}}]}}\n",
            serde_json::to_string(text).unwrap()
        )
    }

    fn collect_openai_text(output: &[u8]) -> String {
        let adapter = adapter_for(Protocol::OpenAiChat);
        String::from_utf8_lossy(output)
            .lines()
            .filter_map(|line| adapter.parse_delta(line))
            .collect()
    }

    #[test]
    fn test_stream_transform_openai() {
        let adapter = adapter_for(Protocol::OpenAiChat);
        let mut transform = StreamTransform::new(
            adapter,
            reverse_map(&[("James Mitchell", "John Smith")]),
        );

        let mut output = Vec::new();
        output.extend(transform.transform_chunk(openai_delta("Dear James ").as_bytes()).unwrap());
        output.extend(transform.transform_chunk(openai_delta("Mitchell, hi").as_bytes()).unwrap());
        output.extend(transform.transform_chunk(b"data: [DONE]\n").unwrap());

        let text = collect_openai_text(&output);
        assert_eq!(text, "Dear John Smith, hi");
        assert!(String::from_utf8_lossy(&output).contains("data: [DONE]"));
    }

    #[test]
    fn test_stream_transform_flushes_before_done() {
        let adapter = adapter_for(Protocol::OpenAiChat);
        let mut transform = StreamTransform::new(
            adapter,
            reverse_map(&[("James Mitchell", "John Smith")]),
        );

        let mut output = Vec::new();
        // Ends mid-pseudonym-prefix; [DONE] must still be the last line.
        output.extend(transform.transform_chunk(openai_delta("ping James Mit").as_bytes()).unwrap());
        output.extend(transform.transform_chunk(b"data: [DONE]\n").unwrap());

        let rendered = String::from_utf8_lossy(&output);
        assert_eq!(collect_openai_text(&output), "ping James Mit");
        assert!(rendered.trim_end().ends_with("data: [DONE]"));
    }

    #[test]
    fn test_stream_transform_passes_non_delta_lines() {
        let adapter = adapter_for(Protocol::AnthropicMessages);
        let mut transform = StreamTransform::new(
            adapter,
            reverse_map(&[("James Mitchell", "John Smith")]),
        );

        let start = b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"m1\"}}\n";
        let output = transform.transform_chunk(start).unwrap();
        assert_eq!(output, start.to_vec());
    }

    #[test]
    fn test_stream_transform_anthropic_delta() {
        let adapter = adapter_for(Protocol::AnthropicMessages);
        let mut transform = StreamTransform::new(
            adapter,
            reverse_map(&[("James Mitchell", "John Smith")]),
        );

        let delta = |t: &str| {
            format!(
                "data: {{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{{\"type\":\"text_delta\",\"text\":{}}}}}\n",
                serde_json::to_string(t).unwrap()
            )
        };

        let mut output = Vec::new();
        output.extend(transform.transform_chunk(delta("for James Mitch").as_bytes()).unwrap());
        output.extend(transform.transform_chunk(delta("ell only").as_bytes()).unwrap());
        output.extend(
            transform
                .transform_chunk(b"data: {\"type\":\"message_stop\"}\n")
                .unwrap(),
        );

        let adapter = adapter_for(Protocol::AnthropicMessages);
        let text: String = String::from_utf8_lossy(&output)
            .lines()
            .filter_map(|line| adapter.parse_delta(line))
            .collect();
        assert_eq!(text, "for John Smith only");
    }

    #[test]
    fn test_anthropic_holdback_released_before_block_stop() {
        let adapter = adapter_for(Protocol::AnthropicMessages);
        let mut transform = StreamTransform::new(
            adapter,
            reverse_map(&[("James Mitchell", "John Smith")]),
        );

        let delta = "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ping James Mit\"}}\n";
        let mut output = Vec::new();
        output.extend(transform.transform_chunk(delta.as_bytes()).unwrap());
        output.extend(
            transform
                .transform_chunk(b"data: {\"type\":\"content_block_stop\",\"index\":0}\n")
                .unwrap(),
        );
        output.extend(
            transform
                .transform_chunk(b"data: {\"type\":\"message_stop\"}\n")
                .unwrap(),
        );

        let rendered = String::from_utf8_lossy(&output);
        let lines: Vec<&str> = rendered.lines().collect();
        let stop_at = lines
            .iter()
            .position(|l| l.contains("content_block_stop"))
            .unwrap();
        let adapter = adapter_for(Protocol::AnthropicMessages);
        let text: String = lines[..stop_at]
            .iter()
            .filter_map(|line| adapter.parse_delta(line))
            .collect();
        assert_eq!(text, "ping James Mit");
        assert!(lines
            .iter()
            .skip(stop_at)
            .all(|l| adapter.parse_delta(l).is_none()));
    }

    #[test]
    fn test_chunk_split_mid_line() {
        let adapter = adapter_for(Protocol::OpenAiChat);
        let mut transform = StreamTransform::new(
            adapter,
            reverse_map(&[("James Mitchell", "John Smith")]),
        );

        let line = openai_delta("hello James Mitchell bye");
        let (a, b) = line.split_at(20);

        let mut output = Vec::new();
        output.extend(transform.transform_chunk(a.as_bytes()).unwrap());
        output.extend(transform.transform_chunk(b.as_bytes()).unwrap());
        output.extend(transform.finish().unwrap());

        assert_eq!(collect_openai_text(&output), "hello John Smith bye");
    }
}
