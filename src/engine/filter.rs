//! Per-tool suppression of progress noise in decoded output.
//!
//! Filters are fail-open: a filter that panics keeps the line.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// One decoded output line together with the bytes it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    pub text: String,
    pub raw: Vec<u8>,
}

impl DecodedLine {
    /// Leading spaces in the raw line, ignoring UTF-16 NUL padding.
    pub fn raw_indent(&self) -> usize {
        self.raw
            .iter()
            .filter(|b| **b != 0)
            .take_while(|b| **b == b' ')
            .count()
    }
}

pub trait LineFilter: Send + Sync {
    fn keep(&self, line: &str) -> bool;

    /// Filters that care about layout (e.g. indentation lost by trimming)
    /// override this; the default only looks at the text.
    fn keep_decoded(&self, line: &DecodedLine) -> bool {
        self.keep(&line.text)
    }
}

/// Apply an optional filter, keeping the line when there is no filter or the
/// filter panics.
pub fn keep_line(filter: Option<&dyn LineFilter>, line: &DecodedLine) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    match catch_unwind(AssertUnwindSafe(|| filter.keep_decoded(line))) {
        Ok(keep) => keep,
        Err(_) => {
            warn!(line = %line.text, "line filter panicked; keeping line");
            true
        }
    }
}

/// Drops whitespace-only lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlankLineFilter;

impl LineFilter for BlankLineFilter {
    fn keep(&self, line: &str) -> bool {
        !line.trim().is_empty()
    }
}

const DEFRAG_NOISE: &[&str] = &[
    "Volume information",
    "Informazioni sul volume",
    "Volume size",
    "Dimensioni volume",
    "Free space",
    "Spazio disponibile",
    "Total space",
    "Spazio totale",
    "Post Defragmentation",
    "Report frammentazione",
    "Invoking",
    "Chiamata di",
    "Re-optimize",
    "Riottimizza",
    "Analysis:",
    "Analisi:",
    "Note:",
    "Nota:",
];

const HEALTH_SCAN_NOISE: &[&str] = &[
    // SFC / DISM progress
    "Avvio in corso",
    "Attendere",
    "L'operazione richieder",
    "100%",
    "completed",
    "Avanzamento:",
    "ETA:",
    "Fase:",
    "totale:",
    "percent complete",
    "% complete",
    "Beginning system scan",
    "Beginning verification phase",
    "This process will take some time",
    // CHKDSK banners
    "Il file system",
    "etichetta del volume",
    "Durata fase",
    "Verifica file",
    "Verifica indici",
    "Verifica descrittori",
    "journal USN",
    "KB di spazio",
    "KB in",
    "KB occupati",
    "KB disponibili",
    "byte in ogni",
    "allocazione",
    "The type of the file system",
    "Volume label is",
    "KB total disk space",
    "allocation unit",
];

/// Substring blacklist, optionally dropping deeply-indented continuation lines.
#[derive(Debug, Clone)]
pub struct PhraseFilter {
    phrases: Vec<String>,
    max_indent: Option<usize>,
}

impl PhraseFilter {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phrases: phrases.into_iter().map(Into::into).collect(),
            max_indent: None,
        }
    }

    /// Drop lines indented by `indent` spaces or more in the raw output.
    pub fn dropping_indent(mut self, indent: usize) -> Self {
        self.max_indent = Some(indent);
        self
    }

    /// Volume banners printed by `defrag`.
    pub fn defrag() -> Self {
        Self::new(DEFRAG_NOISE.iter().copied()).dropping_indent(8)
    }

    /// Progress chatter printed by `sfc`, `DISM` and `chkdsk`.
    pub fn health_scan() -> Self {
        Self::new(HEALTH_SCAN_NOISE.iter().copied())
    }
}

impl LineFilter for PhraseFilter {
    fn keep(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        !self.phrases.iter().any(|p| line.contains(p.as_str()))
    }

    fn keep_decoded(&self, line: &DecodedLine) -> bool {
        if let Some(max) = self.max_indent {
            if line.raw_indent() >= max {
                return false;
            }
        }
        self.keep(&line.text)
    }
}

/// Closure-backed filter for ad hoc rules.
pub struct FnFilter<F>(pub F);

impl<F> LineFilter for FnFilter<F>
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn keep(&self, line: &str) -> bool {
        (self.0)(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(raw: &str) -> DecodedLine {
        DecodedLine {
            text: raw.trim().to_string(),
            raw: raw.as_bytes().to_vec(),
        }
    }

    #[test]
    fn no_filter_keeps_everything() {
        assert!(keep_line(None, &decoded("anything")));
    }

    #[test]
    fn blank_filter_drops_whitespace_only() {
        let f = BlankLineFilter;
        assert!(!f.keep(""));
        assert!(!f.keep("   \t"));
        assert!(f.keep("ok"));
    }

    #[test]
    fn defrag_filter_drops_banners_in_both_locales() {
        let f = PhraseFilter::defrag();
        assert!(!f.keep("Volume size                 = 475.83 GB"));
        assert!(!f.keep("Dimensioni volume           = 475,83 GB"));
        assert!(!f.keep("Nota: bla"));
        assert!(f.keep("Retrim: 100% complete."));
        assert!(f.keep("The operation completed successfully."));
    }

    #[test]
    fn defrag_filter_drops_indented_continuation() {
        let f = PhraseFilter::defrag();
        assert!(!keep_line(Some(&f), &decoded("        Free space = 10 GB")));
        assert!(!keep_line(Some(&f), &decoded("          fragmented files")));
        assert!(keep_line(Some(&f), &decoded("  Optimizing C:")));
    }

    #[test]
    fn indentation_ignores_utf16_padding() {
        let line = DecodedLine {
            text: "x".into(),
            raw: b" \0 \0 \0 \0 \0 \0 \0 \0x\0".to_vec(),
        };
        assert_eq!(line.raw_indent(), 8);
    }

    #[test]
    fn health_filter_keeps_results_and_drops_progress() {
        let f = PhraseFilter::health_scan();
        assert!(!f.keep("Verification 45% complete."));
        assert!(!f.keep("Avanzamento: 20%"));
        assert!(!f.keep("4096 byte in ogni unità di allocazione."));
        assert!(!f.keep(""));
        assert!(f.keep("Windows Resource Protection did not find any integrity violations."));
        assert!(f.keep("No component store corruption detected."));
    }

    #[test]
    fn panicking_filter_fails_open() {
        let f = FnFilter(|line: &str| -> bool {
            if line.contains("boom") {
                panic!("filter bug");
            }
            false
        });
        assert!(keep_line(Some(&f), &decoded("boom")));
        assert!(!keep_line(Some(&f), &decoded("quiet")));
    }
}
