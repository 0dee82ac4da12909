//! Hybrid fallback chain for files the grammar path cannot or should not handle.
//!
//! Parsers are consulted in registration order and the first whose predicate accepts
//! the file produces the blocks. The built-ins are the config-section parser and the
//! plain-text parser; custom parsers are appended after them.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::acquirer::looks_binary;
use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, Result};
use crate::types::{
    BlockType, CodeBlock, ExtractionMetadata, ExtractionMethod, ExtractionResult, LineIndex,
};

pub const NO_PARSER_MESSAGE: &str = "No suitable fallback parser found";

static SECTION_HEADER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^\[([^\]]+)\]").ok());

const HEADER_PROBE_LINES: usize = 50;
const TEXT_PROBE_CHARS: usize = 1000;
const LONG_LINE_CHARS: usize = 200;

/// A parser the chain can route a file to.
pub trait FallbackParser: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Glob patterns the parser claims
    fn patterns(&self) -> &[String];

    fn can_parse(&self, file_path: &str, content: &str) -> bool;

    fn parse(&self, content: &str, file_path: &str, file_hash: &str) -> Result<Vec<CodeBlock>>;
}

/// Introspection record for a registered parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParserInfo {
    pub name: String,
    pub description: String,
    pub patterns: Vec<String>,
}

/// Fixed-size windows of whole lines, each a `text_chunk` block.
#[derive(Debug, Clone)]
pub struct PlainTextParser {
    patterns: Vec<String>,
    globs: GlobSet,
    chunk_size: usize,
    min_chunk_lines: usize,
}

impl PlainTextParser {
    #[must_use]
    pub fn new(patterns: Vec<String>, chunk_size: usize, min_chunk_lines: usize) -> Self {
        let globs = compile_globs(&patterns, true);
        Self {
            patterns,
            globs,
            chunk_size: chunk_size.max(1),
            min_chunk_lines: min_chunk_lines.max(1),
        }
    }

    /// Claims the `text`, `documentation` and `data` pattern categories.
    #[must_use]
    pub fn from_config(config: &ChunkerConfig) -> Self {
        let patterns = ["text", "documentation", "data"]
            .iter()
            .filter_map(|category| config.fallback_parser_patterns.get(*category))
            .flatten()
            .cloned()
            .collect();
        Self::new(patterns, config.text_chunk_size, config.text_min_chunk_lines)
    }

    fn split(&self, content: &str, file_path: &str, file_hash: &str) -> Result<Vec<CodeBlock>> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let index = LineIndex::new(content);
        let last = last_non_blank_line(&index);
        let slice = |start: usize, end: usize| {
            index.slice(start, end).ok_or_else(|| {
                ChunkerError::parse(format!("{file_path}: invalid line span {start}-{end}"))
            })
        };

        if last < self.min_chunk_lines {
            let block = CodeBlock::new(
                file_path,
                BlockType::TextChunk,
                1,
                last,
                slice(1, last)?,
                file_hash,
            )
            .with_identifier("content");
            return Ok(vec![block]);
        }

        let mut windows: Vec<(usize, usize)> = Vec::new();
        let mut start = 1;
        let mut size = 0;
        for line in 1..=last {
            size += slice(line, line)?.len() + 1;
            let lines = line - start + 1;
            if (size >= self.chunk_size && lines >= self.min_chunk_lines) || line == last {
                windows.push((start, line));
                start = line + 1;
                size = 0;
            }
        }

        // A short tail joins the window before it.
        if windows.len() > 1 {
            let (tail_start, tail_end) = windows[windows.len() - 1];
            if tail_end - tail_start + 1 < self.min_chunk_lines {
                windows.pop();
                if let Some(previous) = windows.last_mut() {
                    previous.1 = tail_end;
                }
            }
        }

        let mut blocks = Vec::with_capacity(windows.len());
        for (start, end) in windows {
            let text = slice(start, end)?;
            if text.trim().is_empty() {
                continue;
            }
            blocks.push(
                CodeBlock::new(file_path, BlockType::TextChunk, start, end, text, file_hash)
                    .with_identifier(format!("chunk_{start}")),
            );
        }
        Ok(blocks)
    }
}

impl FallbackParser for PlainTextParser {
    fn name(&self) -> &str {
        "plain_text"
    }

    fn description(&self) -> &str {
        "Line windows over plain text, documentation and data files"
    }

    fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn can_parse(&self, file_path: &str, content: &str) -> bool {
        if looks_binary(content.as_bytes()) {
            return false;
        }
        if self.globs.is_match(normalize_path(file_path)) {
            return true;
        }
        looks_like_prose(content)
    }

    fn parse(&self, content: &str, file_path: &str, file_hash: &str) -> Result<Vec<CodeBlock>> {
        self.split(content, file_path, file_hash)
    }
}

/// One `config_section` block per `[section]` header.
///
/// Content before the first header is not emitted. Files without headers go to the
/// embedded plain-text parser.
#[derive(Debug, Clone)]
pub struct ConfigSectionParser {
    patterns: Vec<String>,
    globs: GlobSet,
    plain: PlainTextParser,
}

impl ConfigSectionParser {
    #[must_use]
    pub fn new(patterns: Vec<String>, plain: PlainTextParser) -> Self {
        let globs = compile_globs(&patterns, true);
        Self {
            patterns,
            globs,
            plain,
        }
    }

    #[must_use]
    pub fn from_config(config: &ChunkerConfig) -> Self {
        let patterns = config
            .fallback_parser_patterns
            .get("config")
            .cloned()
            .unwrap_or_default();
        Self::new(patterns, PlainTextParser::from_config(config))
    }
}

impl FallbackParser for ConfigSectionParser {
    fn name(&self) -> &str {
        "config_sections"
    }

    fn description(&self) -> &str {
        "Sections of INI-style configuration files"
    }

    fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn can_parse(&self, file_path: &str, content: &str) -> bool {
        if looks_binary(content.as_bytes()) {
            return false;
        }
        if self.globs.is_match(normalize_path(file_path)) {
            return true;
        }
        content
            .lines()
            .take(HEADER_PROBE_LINES)
            .any(|line| section_name(line).is_some())
    }

    fn parse(&self, content: &str, file_path: &str, file_hash: &str) -> Result<Vec<CodeBlock>> {
        let index = LineIndex::new(content);
        let headers: Vec<(usize, String)> = (1..=index.line_count())
            .filter_map(|line| {
                let text = index.slice(line, line)?;
                section_name(text).map(|name| (line, name))
            })
            .collect();

        if headers.is_empty() {
            log::debug!("{file_path}: no section headers, splitting as plain text");
            return self.plain.parse(content, file_path, file_hash);
        }

        let mut blocks = Vec::with_capacity(headers.len());
        for (position, (start, name)) in headers.iter().enumerate() {
            let mut end = headers
                .get(position + 1)
                .map_or(index.line_count(), |(next, _)| next - 1);
            while end > *start && index.slice(end, end).is_some_and(|l| l.trim().is_empty()) {
                end -= 1;
            }
            let text = index.slice(*start, end).ok_or_else(|| {
                ChunkerError::parse(format!("{file_path}: invalid section span {start}-{end}"))
            })?;
            blocks.push(
                CodeBlock::new(
                    file_path,
                    BlockType::ConfigSection,
                    *start,
                    end,
                    text,
                    file_hash,
                )
                .with_identifier(name.clone()),
            );
        }
        Ok(blocks)
    }
}

/// Ordered registry of fallback parsers.
pub struct HybridFallbackChain {
    parsers: RwLock<Vec<Arc<dyn FallbackParser>>>,
}

impl std::fmt::Debug for HybridFallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridFallbackChain")
            .field("parsers", &self.available_parsers())
            .finish()
    }
}

impl HybridFallbackChain {
    /// Chain with the built-in parsers: config sections first, then plain text.
    #[must_use]
    pub fn new(config: &ChunkerConfig) -> Self {
        let builtins: Vec<Arc<dyn FallbackParser>> = vec![
            Arc::new(ConfigSectionParser::from_config(config)),
            Arc::new(PlainTextParser::from_config(config)),
        ];
        Self {
            parsers: RwLock::new(builtins),
        }
    }

    /// Chain without any parser; every file is rejected until one is registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            parsers: RwLock::new(Vec::new()),
        }
    }

    /// Append a parser after those already registered.
    pub fn register(&self, parser: Arc<dyn FallbackParser>) {
        log::debug!("Registering fallback parser {}", parser.name());
        if let Ok(mut parsers) = self.parsers.write() {
            parsers.push(parser);
        }
    }

    #[must_use]
    pub fn available_parsers(&self) -> Vec<ParserInfo> {
        self.snapshot()
            .iter()
            .map(|parser| ParserInfo {
                name: parser.name().to_string(),
                description: parser.description().to_string(),
                patterns: parser.patterns().to_vec(),
            })
            .collect()
    }

    /// Route `content` to the first accepting parser.
    ///
    /// A failing parser is reported as a failed result.
    #[must_use]
    pub fn parse_with_fallback(
        &self,
        content: &str,
        file_path: &str,
        file_hash: &str,
    ) -> ExtractionResult {
        let started = Instant::now();
        match self.try_parse_with_fallback(content, file_path, file_hash) {
            Ok(result) => result,
            Err((parser, e)) => {
                let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::Fallback);
                metadata.fallback_parser_used = Some(parser);
                metadata.processing_time_ms = elapsed_ms(started);
                ExtractionResult::failure(e.to_string(), metadata)
            }
        }
    }

    /// Like [`Self::parse_with_fallback`], but surfaces a parser error together with
    /// the name of the parser that raised it.
    pub(crate) fn try_parse_with_fallback(
        &self,
        content: &str,
        file_path: &str,
        file_hash: &str,
    ) -> std::result::Result<ExtractionResult, (String, ChunkerError)> {
        let started = Instant::now();
        let mut tried = Vec::new();

        for parser in self.snapshot() {
            tried.push(parser.name().to_string());
            if !parser.can_parse(file_path, content) {
                continue;
            }

            log::debug!("{file_path}: using fallback parser {}", parser.name());
            let blocks = parser
                .parse(content, file_path, file_hash)
                .map_err(|e| (parser.name().to_string(), e))?;

            let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::Fallback)
                .extra("fallback_parsers_tried", tried);
            metadata.fallback_parser_used = Some(parser.name().to_string());
            metadata.processing_time_ms = elapsed_ms(started);
            return Ok(ExtractionResult::success(blocks, metadata));
        }

        log::debug!("{file_path}: no fallback parser accepted the file");
        let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::None)
            .extra("fallback_parsers_tried", tried);
        metadata.processing_time_ms = elapsed_ms(started);
        Ok(ExtractionResult::failure(NO_PARSER_MESSAGE, metadata))
    }

    fn snapshot(&self) -> Vec<Arc<dyn FallbackParser>> {
        self.parsers
            .read()
            .map(|parsers| parsers.clone())
            .unwrap_or_default()
    }
}

/// Compile `patterns` into one set. Invalid patterns are logged and skipped;
/// [`ChunkerConfig::validate`] rejects them up front.
pub(crate) fn compile_globs(patterns: &[String], case_insensitive: bool) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match GlobBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
        {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => log::warn!("Ignoring invalid glob pattern '{pattern}': {e}"),
        }
    }
    builder.build().unwrap_or_else(|e| {
        log::warn!("Failed to build glob set: {e}");
        GlobSet::empty()
    })
}

pub(crate) fn normalize_path(file_path: &str) -> String {
    file_path.replace('\\', "/")
}

fn section_name(line: &str) -> Option<String> {
    let header = SECTION_HEADER.as_ref()?;
    let captures = header.captures(line.trim())?;
    let name = captures.get(1)?.as_str().trim();
    (!name.is_empty()).then(|| name.to_string())
}

fn last_non_blank_line(index: &LineIndex<'_>) -> usize {
    (1..=index.line_count())
        .rev()
        .find(|line| index.slice(*line, *line).is_some_and(|l| !l.trim().is_empty()))
        .unwrap_or(1)
}

fn looks_like_prose(content: &str) -> bool {
    let sample: Vec<char> = content.chars().take(TEXT_PROBE_CHARS).collect();
    if sample.iter().all(|c| c.is_whitespace()) {
        return false;
    }
    let printable = sample
        .iter()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .count();
    if printable * 100 <= sample.len() * 95 {
        return false;
    }

    let lines: Vec<&str> = content.lines().collect();
    if lines.len() > 100 {
        let long = lines
            .iter()
            .filter(|line| line.chars().count() > LONG_LINE_CHARS)
            .count();
        if long * 2 > lines.len() {
            return false;
        }
    }
    true
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chain() -> HybridFallbackChain {
        HybridFallbackChain::new(&ChunkerConfig::default())
    }

    #[test]
    fn ini_sections_become_config_blocks() {
        let ini = "; comment\n[server]\nhost = localhost\nport = 8080\n\n[client]\nretries = 3\n";
        let result = chain().parse_with_fallback(ini, "app.ini", "h");

        assert!(result.success);
        assert_eq!(
            result.metadata.fallback_parser_used.as_deref(),
            Some("config_sections")
        );
        let sections: Vec<_> = result
            .blocks
            .iter()
            .map(|b| (b.identifier.as_str(), b.block_type, b.start_line, b.end_line))
            .collect();
        assert_eq!(
            sections,
            vec![
                ("server", BlockType::ConfigSection, 2, 4),
                ("client", BlockType::ConfigSection, 6, 7),
            ]
        );
        assert_eq!(result.blocks[0].content, "[server]\nhost = localhost\nport = 8080");
    }

    #[test]
    fn headers_detected_without_config_extension() {
        let content = "[a]\nx = 1\n[b]\ny = 2\n";
        let result = chain().parse_with_fallback(content, "settings.unknown", "h");
        assert_eq!(result.blocks.len(), 2);
        assert!(result
            .blocks
            .iter()
            .all(|b| b.block_type == BlockType::ConfigSection));
    }

    #[test]
    fn config_without_headers_defers_to_plain_text() {
        let content = "KEY=value\nOTHER=thing\n";
        let result = chain().parse_with_fallback(content, ".env", "h");
        assert!(result.success);
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].block_type, BlockType::TextChunk);
        assert_eq!(result.blocks[0].identifier, "content");
    }

    #[test]
    fn short_text_is_one_block() {
        let result = chain().parse_with_fallback("line one\nline two\n", "notes.txt", "h");
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].content, "line one\nline two");
        assert_eq!((result.blocks[0].start_line, result.blocks[0].end_line), (1, 2));
    }

    #[test]
    fn long_text_is_windowed_without_short_tail() {
        let line = "x".repeat(99);
        let content = vec![line.as_str(); 45].join("\n");
        let parser = PlainTextParser::new(vec!["*.txt".to_string()], 1000, 10);
        let blocks = parser.parse(&content, "big.txt", "h").unwrap();

        let spans: Vec<_> = blocks.iter().map(|b| (b.start_line, b.end_line)).collect();
        assert_eq!(spans, vec![(1, 10), (11, 20), (21, 30), (31, 45)]);
        assert_eq!(blocks[1].identifier, "chunk_11");
        for block in &blocks {
            assert_eq!(
                crate::types::line_span(&content, block.start_line, block.end_line),
                Some(block.content.as_str())
            );
        }
    }

    #[test]
    fn binary_content_matches_no_parser() {
        let content = "\u{0}\u{1}\u{2}PNG\u{0}";
        let result = chain().parse_with_fallback(content, "image.txt", "h");
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some(NO_PARSER_MESSAGE));
        assert_eq!(
            result.metadata.extra["fallback_parsers_tried"],
            serde_json::json!(["config_sections", "plain_text"])
        );
    }

    #[test]
    fn minified_lines_are_not_prose() {
        let line = "a".repeat(300);
        let content = vec![line.as_str(); 150].join("\n");
        assert!(!looks_like_prose(&content));
        assert!(looks_like_prose("hello\nworld\n"));
    }

    struct Failing;

    impl FallbackParser for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always errors"
        }
        fn patterns(&self) -> &[String] {
            &[]
        }
        fn can_parse(&self, _: &str, _: &str) -> bool {
            true
        }
        fn parse(&self, _: &str, _: &str, _: &str) -> Result<Vec<CodeBlock>> {
            Err(ChunkerError::parse("boom"))
        }
    }

    #[test]
    fn registered_parsers_follow_builtins() {
        let chain = chain();
        chain.register(Arc::new(Failing));
        let names: Vec<_> = chain
            .available_parsers()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["config_sections", "plain_text", "failing"]);
    }

    #[test]
    fn parser_error_becomes_failed_result() {
        let chain = HybridFallbackChain::empty();
        chain.register(Arc::new(Failing));

        assert!(chain.try_parse_with_fallback("x", "a.bin", "h").is_err());
        let result = chain.parse_with_fallback("x", "a.bin", "h");
        assert!(!result.success);
        assert_eq!(result.metadata.fallback_parser_used.as_deref(), Some("failing"));
        assert!(result.error_message.unwrap().contains("boom"));
    }
}
