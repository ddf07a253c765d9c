//! Decoding of raw tool output under an unknown console code page.
//!
//! Windows utilities write in the OEM code page, the ANSI code page or UTF-8
//! depending on the tool and on `chcp`; the resolver tries each candidate in
//! priority order and never fails.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use std::borrow::Cow;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct EncodingResolver {
    candidates: Vec<&'static Encoding>,
    fallback: &'static Encoding,
}

impl Default for EncodingResolver {
    fn default() -> Self {
        Self::new(vec![UTF_8, WINDOWS_1252])
    }
}

impl EncodingResolver {
    pub fn new(candidates: Vec<&'static Encoding>) -> Self {
        Self {
            candidates,
            fallback: UTF_8,
        }
    }

    /// Build a resolver from WHATWG labels such as `utf-8`, `windows-1252`, `ibm866`.
    ///
    /// Unknown labels are skipped. An empty result falls back to the default list.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut candidates: Vec<&'static Encoding> = Vec::new();
        for label in labels {
            let label = label.as_ref().trim();
            match Encoding::for_label(label.as_bytes()) {
                Some(enc) if !candidates.contains(&enc) => candidates.push(enc),
                Some(_) => {}
                None => warn!(label, "ignoring unknown encoding label"),
            }
        }
        if candidates.is_empty() {
            return Self::default();
        }
        Self::new(candidates)
    }

    pub fn candidate_names(&self) -> Vec<&'static str> {
        self.candidates.iter().map(|e| e.name()).collect()
    }

    /// Decode one raw line. Always returns text; undecodable sequences end up
    /// as U+FFFD through the fallback encoding.
    pub fn decode(&self, raw: &[u8]) -> String {
        let text: Cow<'_, str> = self
            .candidates
            .iter()
            .find_map(|enc| enc.decode_without_bom_handling_and_without_replacement(raw))
            .unwrap_or_else(|| self.fallback.decode_without_bom_handling(raw).0);
        clean(&text)
    }
}

fn clean(text: &str) -> String {
    text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .trim_start()
        .to_string()
}
