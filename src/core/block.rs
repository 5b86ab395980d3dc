//! Managed block editing
//!
//! A managed block is a span of a plain-text configuration file delimited by a
//! pair of literal marker lines:
//!
//! ```text
//! # BEGIN TOR-GATEWAY
//! TransPort 192.168.42.1:9040
//! # END TOR-GATEWAY
//! ```
//!
//! The span is machine-owned: [`ManagedBlockEditor::apply`] removes the existing
//! span (if any) and appends a freshly built one at the end of the document.
//! Content outside the span is never touched, so applying the same content twice
//! yields the same document.
//!
//! # Example
//!
//! ```
//! use torgw::core::block::{BlockMarker, ConfigDocument, ManagedBlockEditor};
//!
//! let editor = ManagedBlockEditor::new(BlockMarker::new("TAG").unwrap());
//! let doc = ConfigDocument::parse("SocksPort 9050\n");
//! let content = vec!["A=1".to_string(), "B=2".to_string()];
//!
//! let edited = editor.apply(&doc, &content).unwrap();
//! assert_eq!(edited.render(), "SocksPort 9050\n# BEGIN TAG\nA=1\nB=2\n# END TAG\n");
//! assert_eq!(editor.apply(&edited, &content).unwrap(), edited);
//! ```

use crate::core::error::BlockError;
use std::fmt;

/// The BEGIN/END marker pair of a managed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMarker {
    tag: String,
    begin: String,
    end: String,
}

impl BlockMarker {
    /// Creates a marker pair `# BEGIN <tag>` / `# END <tag>`.
    ///
    /// # Errors
    ///
    /// Returns `BlockError::InvalidMarker` if the tag is empty, spans lines, or
    /// carries leading/trailing whitespace (which would not survive line trimming).
    pub fn new(tag: impl Into<String>) -> Result<Self, BlockError> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(BlockError::InvalidMarker("tag cannot be empty".into()));
        }
        if tag.contains(['\n', '\r']) {
            return Err(BlockError::InvalidMarker(format!(
                "tag {tag:?} spans multiple lines"
            )));
        }
        if tag.trim() != tag {
            return Err(BlockError::InvalidMarker(format!(
                "tag {tag:?} has surrounding whitespace"
            )));
        }

        Ok(Self {
            begin: format!("# BEGIN {tag}"),
            end: format!("# END {tag}"),
            tag,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn begin(&self) -> &str {
        &self.begin
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    fn is_begin(&self, line: &str) -> bool {
        line.trim_end() == self.begin
    }

    fn is_end(&self, line: &str) -> bool {
        line.trim_end() == self.end
    }
}

/// Terminator of one line as it appeared in the source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LineEnding {
    #[default]
    Lf,
    CrLf,
    /// Last line of a document without a final newline
    Missing,
}

impl LineEnding {
    fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::Missing => "",
        }
    }
}

/// An ordered sequence of text lines.
///
/// Each line keeps the terminator it was parsed with, so rendering an
/// unmodified document reproduces the input byte for byte. Lines added by the
/// editor use the document's dominant ending (that of its first terminated
/// line, `\n` when there is none).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<String>,
    endings: Vec<LineEnding>,
}

impl ConfigDocument {
    /// A document of `\n`-terminated lines.
    pub fn new(lines: Vec<String>) -> Self {
        let endings = vec![LineEnding::Lf; lines.len()];
        Self { lines, endings }
    }

    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        for raw in text.split_inclusive('\n') {
            let (line, ending) = if let Some(line) = raw.strip_suffix("\r\n") {
                (line, LineEnding::CrLf)
            } else if let Some(line) = raw.strip_suffix('\n') {
                (line, LineEnding::Lf)
            } else {
                (raw, LineEnding::Missing)
            };
            doc.lines.push(line.to_string());
            doc.endings.push(ending);
        }
        doc
    }

    /// Line contents, without terminators.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// True when the document's lines end in `\r\n`.
    pub fn is_crlf(&self) -> bool {
        self.newline() == LineEnding::CrLf
    }

    fn newline(&self) -> LineEnding {
        self.endings
            .iter()
            .copied()
            .find(|e| *e != LineEnding::Missing)
            .unwrap_or_default()
    }

    pub fn render(&self) -> String {
        let capacity = self.lines.iter().map(|l| l.len() + 2).sum();
        let mut out = String::with_capacity(capacity);
        for (line, ending) in self.lines.iter().zip(&self.endings) {
            out.push_str(line);
            out.push_str(ending.as_str());
        }
        out
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Zero-based, inclusive line range of a located block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    begin: usize,
    end: usize,
}

/// Finds and replaces the managed block of one marker pair.
#[derive(Debug, Clone)]
pub struct ManagedBlockEditor {
    marker: BlockMarker,
}

impl ManagedBlockEditor {
    pub fn new(marker: BlockMarker) -> Self {
        Self { marker }
    }

    pub fn marker(&self) -> &BlockMarker {
        &self.marker
    }

    /// Replaces the managed block with `content`, appending it at the end of the document.
    ///
    /// The input document is borrowed and never modified; on error the caller
    /// still holds the original.
    ///
    /// # Errors
    ///
    /// - `BlockError::Malformed` for a BEGIN without END or an END without BEGIN
    /// - `BlockError::Ambiguous` when a second marker follows the first complete pair
    /// - `BlockError::InvalidContent` when a content line is itself a marker line
    pub fn apply(
        &self,
        document: &ConfigDocument,
        content: &[String],
    ) -> Result<ConfigDocument, BlockError> {
        self.validate_content(content)?;
        let span = self.locate(document)?;

        let newline = document.newline();
        let mut out = ConfigDocument::default();
        for (i, (line, ending)) in document.lines.iter().zip(&document.endings).enumerate() {
            if span.is_some_and(|s| (s.begin..=s.end).contains(&i)) {
                continue;
            }
            out.lines.push(line.clone());
            out.endings.push(*ending);
        }
        // The block starts on a line of its own
        if let Some(last) = out.endings.last_mut()
            && *last == LineEnding::Missing
        {
            *last = newline;
        }

        out.lines.push(self.marker.begin.clone());
        out.lines.extend(content.iter().cloned());
        out.lines.push(self.marker.end.clone());
        out.endings.resize(out.lines.len(), newline);

        Ok(out)
    }

    /// Returns the lines currently inside the managed block, if there is one.
    pub fn extract(&self, document: &ConfigDocument) -> Result<Option<Vec<String>>, BlockError> {
        Ok(self
            .locate(document)?
            .map(|s| document.lines[s.begin + 1..s.end].to_vec()))
    }

    fn validate_content(&self, content: &[String]) -> Result<(), BlockError> {
        for (index, line) in content.iter().enumerate() {
            if line.contains(['\n', '\r']) {
                return Err(BlockError::InvalidContent {
                    index,
                    reason: "line contains a line break".into(),
                });
            }
            if self.marker.is_begin(line) || self.marker.is_end(line) {
                return Err(BlockError::InvalidContent {
                    index,
                    reason: format!("line {line:?} is a block marker"),
                });
            }
        }
        Ok(())
    }

    fn locate(&self, document: &ConfigDocument) -> Result<Option<Span>, BlockError> {
        let mut begin: Option<usize> = None;
        let mut end: Option<usize> = None;

        for (i, line) in document.lines.iter().enumerate() {
            let is_begin = self.marker.is_begin(line);
            let is_end = self.marker.is_end(line);
            if !is_begin && !is_end {
                continue;
            }

            match (begin, end) {
                (None, _) if is_begin => begin = Some(i),
                (None, _) => {
                    return Err(BlockError::Malformed {
                        line: i + 1,
                        reason: format!("{:?} without preceding BEGIN marker", self.marker.end),
                    });
                }
                (Some(_), None) if is_end => end = Some(i),
                (Some(first), _) => {
                    return Err(BlockError::Ambiguous {
                        first: first + 1,
                        second: i + 1,
                    });
                }
            }
        }

        match (begin, end) {
            (Some(begin), Some(end)) => Ok(Some(Span { begin, end })),
            (Some(begin), None) => Err(BlockError::Malformed {
                line: begin + 1,
                reason: format!("{:?} without matching END marker", self.marker.begin),
            }),
            (None, _) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> ManagedBlockEditor {
        ManagedBlockEditor::new(BlockMarker::new("TAG").unwrap())
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_marker_lines() {
        let marker = BlockMarker::new("TOR-GATEWAY").unwrap();
        assert_eq!(marker.begin(), "# BEGIN TOR-GATEWAY");
        assert_eq!(marker.end(), "# END TOR-GATEWAY");
        assert_eq!(marker.tag(), "TOR-GATEWAY");
    }

    #[test]
    fn test_marker_rejects_bad_tags() {
        assert!(BlockMarker::new("").is_err());
        assert!(BlockMarker::new("A\nB").is_err());
        assert!(BlockMarker::new(" TAG").is_err());
        assert!(BlockMarker::new("TAG ").is_err());
    }

    #[test]
    fn test_empty_document_gets_block() {
        let doc = ConfigDocument::default();
        let out = editor().apply(&doc, &lines(&["A=1", "B=2"])).unwrap();
        assert!(out.render().ends_with("# BEGIN TAG\nA=1\nB=2\n# END TAG\n"));
        assert_eq!(out.lines().len(), 4);
    }

    #[test]
    fn test_existing_block_is_replaced() {
        let doc = ConfigDocument::parse("x\n# BEGIN TAG\nA=1\n# END TAG\n");
        let out = editor().apply(&doc, &lines(&["A=2", "C=3"])).unwrap();
        assert_eq!(out.render(), "x\n# BEGIN TAG\nA=2\nC=3\n# END TAG\n");
        assert!(!out.render().contains("A=1"));
    }

    #[test]
    fn test_block_in_middle_moves_to_end() {
        let doc = ConfigDocument::parse("head\n# BEGIN TAG\nold\n# END TAG\ntail\n");
        let out = editor().apply(&doc, &lines(&["new"])).unwrap();
        assert_eq!(out.render(), "head\ntail\n# BEGIN TAG\nnew\n# END TAG\n");
    }

    #[test]
    fn test_apply_twice_is_noop() {
        let doc = ConfigDocument::parse("SocksPort 9050\nLog notice syslog\n");
        let content = lines(&["TransPort 9040", "DNSPort 53"]);
        let once = editor().apply(&doc, &content).unwrap();
        let twice = editor().apply(&once, &content).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_content_keeps_markers() {
        let doc = ConfigDocument::parse("# BEGIN TAG\nA=1\n# END TAG\n");
        let out = editor().apply(&doc, &[]).unwrap();
        assert_eq!(out.render(), "# BEGIN TAG\n# END TAG\n");
    }

    #[test]
    fn test_begin_without_end_is_malformed() {
        let doc = ConfigDocument::parse("a\n# BEGIN TAG\nA=1\n");
        let err = editor().apply(&doc, &lines(&["A=2"])).unwrap_err();
        assert!(matches!(err, BlockError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_end_without_begin_is_malformed() {
        let doc = ConfigDocument::parse("a\n# END TAG\n");
        let err = editor().apply(&doc, &[]).unwrap_err();
        assert!(matches!(err, BlockError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_two_pairs_are_ambiguous() {
        let text = "# BEGIN TAG\nA=1\n# END TAG\nmid\n# BEGIN TAG\nA=9\n# END TAG\n";
        let doc = ConfigDocument::parse(text);
        let err = editor().apply(&doc, &lines(&["A=2"])).unwrap_err();
        assert_eq!(err, BlockError::Ambiguous { first: 1, second: 5 });
        // Borrowed input stays untouched
        assert_eq!(doc.render(), text);
    }

    #[test]
    fn test_nested_begin_is_ambiguous() {
        let doc = ConfigDocument::parse("# BEGIN TAG\n# BEGIN TAG\n# END TAG\n");
        let err = editor().apply(&doc, &[]).unwrap_err();
        assert!(matches!(err, BlockError::Ambiguous { first: 1, second: 2 }));
    }

    #[test]
    fn test_other_tags_are_ignored() {
        let doc = ConfigDocument::parse("# BEGIN OTHER\nkeep\n# END OTHER\n");
        let out = editor().apply(&doc, &lines(&["A=1"])).unwrap();
        assert!(out.render().starts_with("# BEGIN OTHER\nkeep\n# END OTHER\n"));
    }

    #[test]
    fn test_crlf_markers_are_recognised() {
        let doc = ConfigDocument::parse("x\r\n# BEGIN TAG\r\nA=1\r\n# END TAG\r\n");
        let out = editor().apply(&doc, &lines(&["A=2"])).unwrap();
        assert_eq!(out.render(), "x\r\n# BEGIN TAG\r\nA=2\r\n# END TAG\r\n");
        assert_eq!(out.lines()[0], "x");
    }

    #[test]
    fn test_crlf_document_keeps_its_bytes() {
        let text = "SocksPort 9050\r\nLog notice syslog\r\n";
        let doc = ConfigDocument::parse(text);
        assert!(doc.is_crlf());
        assert_eq!(doc.render(), text);

        let content = lines(&["A=1"]);
        let once = editor().apply(&doc, &content).unwrap();
        let rendered = once.render();
        assert!(rendered.starts_with(text));
        assert_eq!(&rendered[text.len()..], "# BEGIN TAG\r\nA=1\r\n# END TAG\r\n");
        assert_eq!(editor().apply(&once, &content).unwrap().render(), rendered);
    }

    #[test]
    fn test_mixed_endings_outside_block_are_kept() {
        let text = "a\r\nb\n# BEGIN TAG\r\nold\r\n# END TAG\r\nc\n";
        let out = editor()
            .apply(&ConfigDocument::parse(text), &lines(&["new"]))
            .unwrap();
        assert_eq!(
            out.render(),
            "a\r\nb\nc\n# BEGIN TAG\r\nnew\r\n# END TAG\r\n"
        );
    }

    #[test]
    fn test_marker_in_content_is_rejected() {
        let doc = ConfigDocument::default();
        let err = editor()
            .apply(&doc, &lines(&["A=1", "# END TAG"]))
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidContent { index: 1, .. }));
    }

    #[test]
    fn test_multiline_content_is_rejected() {
        let err = editor()
            .apply(&ConfigDocument::default(), &lines(&["A=1\nB=2"]))
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidContent { index: 0, .. }));
    }

    #[test]
    fn test_extract() {
        let doc = ConfigDocument::parse("x\n# BEGIN TAG\nA=1\nB=2\n# END TAG\n");
        assert_eq!(
            editor().extract(&doc).unwrap(),
            Some(lines(&["A=1", "B=2"]))
        );
        assert_eq!(editor().extract(&ConfigDocument::default()).unwrap(), None);
    }

    #[test]
    fn test_missing_final_newline() {
        let doc = ConfigDocument::parse("SocksPort 9050");
        assert_eq!(doc.render(), "SocksPort 9050");

        let out = editor().apply(&doc, &lines(&["A=1"])).unwrap();
        assert_eq!(out.render(), "SocksPort 9050\n# BEGIN TAG\nA=1\n# END TAG\n");
    }
}
