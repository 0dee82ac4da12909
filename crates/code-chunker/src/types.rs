use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A semantic block of source with identity metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeBlock {
    /// Source file path (caller-defined: workspace-relative or absolute)
    pub file_path: String,

    /// Symbol name when known, else empty
    pub identifier: String,

    /// Semantic kind of the block
    #[serde(rename = "type")]
    pub block_type: BlockType,

    /// Start line (1-indexed)
    pub start_line: usize,

    /// End line (1-indexed, inclusive)
    pub end_line: usize,

    /// Exact source slice
    pub content: String,

    /// Content hash of the whole file
    pub file_hash: String,

    /// Content hash of this block
    pub segment_hash: String,
}

impl CodeBlock {
    /// Create a block; the segment hash is derived from its position and content.
    #[must_use]
    pub fn new(
        file_path: impl Into<String>,
        block_type: BlockType,
        start_line: usize,
        end_line: usize,
        content: impl Into<String>,
        file_hash: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let file_hash = file_hash.into();
        let segment_hash = segment_hash(&file_hash, start_line, end_line, &content);
        Self {
            file_path: file_path.into(),
            identifier: String::new(),
            block_type,
            start_line,
            end_line,
            content,
            file_hash,
            segment_hash,
        }
    }

    /// Builder: set identifier
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Get the number of lines in this block
    #[must_use]
    pub const fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    /// Check if block contains a specific line
    #[must_use]
    pub const fn contains_line(&self, line: usize) -> bool {
        line >= self.start_line && line <= self.end_line
    }

    /// Whether two blocks share at least one line
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start_line <= other.end_line && other.start_line <= self.end_line
    }
}

/// Semantic kind of a [`CodeBlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Function or method
    Function,
    /// Class, struct, enum, trait or interface
    Class,
    /// Implementation block
    ImplBlock,
    /// Plain-text fallback window
    TextChunk,
    /// Section of a key/value configuration file
    ConfigSection,
    /// Line or token window
    Chunk,
}

impl BlockType {
    /// Get human-readable name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::ImplBlock => "impl_block",
            Self::TextChunk => "text_chunk",
            Self::ConfigSection => "config_section",
            Self::Chunk => "chunk",
        }
    }

    /// Map a query capture group (`function`, `method`, `struct`, ...) to a block type.
    #[must_use]
    pub fn from_capture_group(group: &str) -> Option<Self> {
        match group {
            "function" | "method" | "constructor" | "arrow_function" => Some(Self::Function),
            "class" | "struct" | "enum" | "trait" | "interface" | "object" | "type" => {
                Some(Self::Class)
            }
            "impl" | "impl_block" => Some(Self::ImplBlock),
            _ => None,
        }
    }

    /// Whether this type comes out of grammar extraction
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::Function | Self::Class | Self::ImplBlock)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the blocks of an [`ExtractionResult`] were produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Grammar query extraction
    Grammar,
    /// Hybrid fallback chain
    Fallback,
    /// Last-resort line windows
    LineWindow,
    /// Nothing produced blocks
    #[default]
    None,
}

/// Diagnostic metadata attached to every extraction attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub extraction_method: ExtractionMethod,

    /// Name of the fallback parser that produced the blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_parser_used: Option<String>,

    /// Language key when one was detected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Why the grammar path was not taken, if it was not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,

    pub processing_time_ms: f64,

    /// Free-form counters (e.g. `dropped_over_cap`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ExtractionMetadata {
    #[must_use]
    pub fn with_method(method: ExtractionMethod) -> Self {
        Self {
            extraction_method: method,
            ..Default::default()
        }
    }

    /// Builder: attach an extra counter or note
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one extraction attempt. Produced by every attempt; callers branch on
/// `success` instead of handling errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    pub blocks: Vec<CodeBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub metadata: ExtractionMetadata,
}

impl ExtractionResult {
    #[must_use]
    pub fn success(blocks: Vec<CodeBlock>, metadata: ExtractionMetadata) -> Self {
        Self {
            success: true,
            blocks,
            error_message: None,
            metadata,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>, metadata: ExtractionMetadata) -> Self {
        Self {
            success: false,
            blocks: Vec::new(),
            error_message: Some(message.into()),
            metadata,
        }
    }

    /// Successful and non-empty
    #[must_use]
    pub fn has_blocks(&self) -> bool {
        self.success && !self.blocks.is_empty()
    }
}

/// SHA-256 hex digest of a file's content
#[must_use]
pub fn file_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest identifying one block of one file version
#[must_use]
pub fn segment_hash(file_hash: &str, start_line: usize, end_line: usize, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_hash.as_bytes());
    hasher.update(format!(":{start_line}:{end_line}:").as_bytes());
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Byte offsets of line starts, for mapping between lines and source slices.
///
/// Lines are separated by `\n`; a trailing newline yields a final empty line.
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    source: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(idx, _)| idx + 1),
        );
        Self { source, starts }
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// 1-based line containing `byte_offset`
    #[must_use]
    pub fn line_of_byte(&self, byte_offset: usize) -> usize {
        match self.starts.binary_search(&byte_offset) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    /// Byte range covering lines `start_line..=end_line` (1-based), excluding the
    /// final line terminator.
    #[must_use]
    pub fn byte_range(&self, start_line: usize, end_line: usize) -> Option<(usize, usize)> {
        if start_line == 0 || start_line > end_line || end_line > self.line_count() {
            return None;
        }
        let start = self.starts[start_line - 1];
        let end = match self.starts.get(end_line) {
            Some(next_start) => next_start - 1,
            None => self.source.len(),
        };
        Some((start, end))
    }

    /// Exact source text of lines `start_line..=end_line` (1-based, inclusive)
    #[must_use]
    pub fn slice(&self, start_line: usize, end_line: usize) -> Option<&'a str> {
        let (start, end) = self.byte_range(start_line, end_line)?;
        self.source.get(start..end)
    }
}

/// Exact source text of lines `start_line..=end_line` (1-based, inclusive)
#[must_use]
pub fn line_span(source: &str, start_line: usize, end_line: usize) -> Option<&str> {
    LineIndex::new(source).slice(start_line, end_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_block_line_count() {
        let block = CodeBlock::new("test.rs", BlockType::Chunk, 10, 15, "code", "h");
        assert_eq!(block.line_count(), 6);
        assert!(block.contains_line(10));
        assert!(block.contains_line(15));
        assert!(!block.contains_line(9));
        assert!(!block.contains_line(16));
    }

    #[test]
    fn test_block_overlap() {
        let a = CodeBlock::new("a.rs", BlockType::Function, 1, 5, "a", "h");
        let b = CodeBlock::new("a.rs", BlockType::Function, 5, 9, "b", "h");
        let c = CodeBlock::new("a.rs", BlockType::Function, 6, 9, "c", "h");
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_segment_hash_depends_on_span_and_content() {
        let base = segment_hash("f", 1, 2, "x");
        assert_ne!(base, segment_hash("f", 1, 3, "x"));
        assert_ne!(base, segment_hash("f", 1, 2, "y"));
        assert_ne!(base, segment_hash("g", 1, 2, "x"));
        assert_eq!(base, segment_hash("f", 1, 2, "x"));
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn test_file_hash_is_sha256_hex() {
        assert_eq!(
            file_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_block_type_serde_names() {
        let block = CodeBlock::new("a.py", BlockType::ImplBlock, 1, 1, "x", "h");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "impl_block");
        assert_eq!(BlockType::ConfigSection.to_string(), "config_section");
    }

    #[test]
    fn test_capture_group_mapping() {
        assert_eq!(BlockType::from_capture_group("method"), Some(BlockType::Function));
        assert_eq!(BlockType::from_capture_group("trait"), Some(BlockType::Class));
        assert_eq!(BlockType::from_capture_group("impl"), Some(BlockType::ImplBlock));
        assert_eq!(BlockType::from_capture_group("heading"), None);
    }

    #[test]
    fn test_line_index_slices() {
        let source = "alpha\nbeta\ngamma\n";
        let index = LineIndex::new(source);
        assert_eq!(index.line_count(), 4);
        assert_eq!(index.slice(1, 1), Some("alpha"));
        assert_eq!(index.slice(2, 3), Some("beta\ngamma"));
        assert_eq!(index.slice(4, 4), Some(""));
        assert_eq!(index.slice(3, 5), None);
        assert_eq!(index.slice(0, 1), None);
        assert_eq!(index.line_of_byte(0), 1);
        assert_eq!(index.line_of_byte(6), 2);
        assert_eq!(index.line_of_byte(8), 2);
        assert_eq!(line_span(source, 1, 3), Some("alpha\nbeta\ngamma"));
    }

    #[test]
    fn test_extraction_result_constructors() {
        let failed = ExtractionResult::failure(
            "No suitable fallback parser found",
            ExtractionMetadata::with_method(ExtractionMethod::Fallback),
        );
        assert!(!failed.success);
        assert!(!failed.has_blocks());
        assert_eq!(
            failed.error_message.as_deref(),
            Some("No suitable fallback parser found")
        );

        let meta = ExtractionMetadata::with_method(ExtractionMethod::Grammar).extra("dropped", 3);
        assert_eq!(meta.extra["dropped"], serde_json::json!(3));
    }
}
