use std::sync::Arc;
use std::time::Instant;

use unicode_segmentation::UnicodeSegmentation;

use crate::config::ChunkerConfig;
use crate::extractor::BlockExtractor;
use crate::language::Language;
use crate::types::{
    BlockType, CodeBlock, ExtractionMetadata, ExtractionMethod, ExtractionResult, LineIndex,
};

/// Line windows may run this much past `max_chars` before they are cut
pub const LINE_WINDOW_TOLERANCE: f64 = 1.15;

/// A way of turning one file's text into blocks. Never fails; blank text yields
/// no blocks.
pub trait ChunkStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn chunk(&self, text: &str, file_path: &str, file_hash: &str) -> Vec<CodeBlock>;
}

/// Non-overlapping windows of whole lines, cut once a window reaches
/// `max_chars * 1.15` characters.
#[derive(Debug, Clone, Copy)]
pub struct LineStrategy {
    max_chars: usize,
    min_chars: usize,
}

impl LineStrategy {
    #[must_use]
    pub const fn new(max_chars: usize, min_chars: usize) -> Self {
        Self {
            max_chars,
            min_chars,
        }
    }

    #[must_use]
    pub const fn from_config(config: &ChunkerConfig) -> Self {
        Self::new(config.line_max_block_chars, config.line_min_block_chars)
    }

    /// Incremental windower with this strategy's limits, for text that arrives a
    /// line at a time.
    pub(crate) fn windower(&self) -> LineWindower {
        LineWindower::new(self.max_chars, self.min_chars)
    }
}

impl ChunkStrategy for LineStrategy {
    fn name(&self) -> &'static str {
        "lines"
    }

    fn chunk(&self, text: &str, file_path: &str, file_hash: &str) -> Vec<CodeBlock> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let mut windower = self.windower();
        for line in text_lines(text) {
            windower.push_line(line);
        }
        windower
            .finish()
            .into_iter()
            .map(|window| window.into_block(file_path, file_hash))
            .collect()
    }
}

/// Line spans (1-based, inclusive) of the windows [`LineStrategy`] cuts from `text`.
pub(crate) fn line_windows(text: &str, max_chars: usize, min_chars: usize) -> Vec<(usize, usize)> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut windower = LineWindower::new(max_chars, min_chars);
    for line in text_lines(text) {
        windower.push_line(line);
    }
    windower
        .finish()
        .into_iter()
        .map(|window| (window.start, window.end))
        .collect()
}

/// Lines of `text`, without the empty line after a final newline.
fn text_lines(text: &str) -> std::str::Split<'_, char> {
    text.strip_suffix('\n').unwrap_or(text).split('\n')
}

fn last_text_line(text: &str, index: &LineIndex<'_>) -> usize {
    index.line_count() - usize::from(text.ends_with('\n'))
}

/// One window of whole lines (1-based, inclusive) and its exact text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LineWindow {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl LineWindow {
    pub(crate) fn into_block(self, file_path: &str, file_hash: &str) -> CodeBlock {
        CodeBlock::new(
            file_path,
            BlockType::Chunk,
            self.start,
            self.end,
            self.text,
            file_hash,
        )
    }

    fn append(&mut self, other: LineWindow) {
        self.text.push('\n');
        self.text.push_str(&other.text);
        self.end = other.end;
    }

    fn is_short(&self, min_chars: usize) -> bool {
        self.text.trim().chars().count() < min_chars
    }
}

/// Cuts a sequence of lines into non-overlapping windows as the lines arrive.
///
/// A window is cut once its size (line bytes plus terminators) reaches
/// `max_chars * 1.15`. A window with fewer than `min_chars` non-blank characters
/// joins the window before it; when nothing has been kept yet it grows into the
/// next one instead. Every line ends up in exactly one window, and text that
/// never reaches `min_chars` becomes a single window. Blank text yields nothing.
#[derive(Debug)]
pub(crate) struct LineWindower {
    limit: usize,
    min_chars: usize,
    next_line: usize,
    open: Option<LineWindow>,
    open_size: usize,
    held: Option<LineWindow>,
    done: Vec<LineWindow>,
}

impl LineWindower {
    pub(crate) fn new(max_chars: usize, min_chars: usize) -> Self {
        Self {
            limit: ((max_chars as f64) * LINE_WINDOW_TOLERANCE) as usize,
            min_chars,
            next_line: 1,
            open: None,
            open_size: 0,
            held: None,
            done: Vec::new(),
        }
    }

    /// Add the next line, without its terminator.
    pub(crate) fn push_line(&mut self, line: &str) {
        if self.open_size >= self.limit {
            self.cut();
        }
        let number = self.next_line;
        self.next_line += 1;
        self.open_size += line.len() + 1;
        let line = LineWindow {
            start: number,
            end: number,
            text: line.to_string(),
        };
        match self.open.as_mut() {
            Some(open) => open.append(line),
            None => self.open = Some(line),
        }
    }

    fn cut(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        self.open_size = 0;
        if !open.is_short(self.min_chars) {
            if let Some(previous) = self.held.replace(open) {
                self.done.push(previous);
            }
            return;
        }
        match self.held.as_mut() {
            Some(held) => held.append(open),
            // Nothing kept yet: keep growing from line 1.
            None => self.open = Some(open),
        }
    }

    /// Close the last window and return every window in line order.
    pub(crate) fn finish(mut self) -> Vec<LineWindow> {
        if let Some(open) = self.open.take() {
            if !open.is_short(self.min_chars) {
                if let Some(previous) = self.held.replace(open) {
                    self.done.push(previous);
                }
            } else {
                match self.held.as_mut() {
                    Some(held) => held.append(open),
                    None if open.text.trim().is_empty() => {}
                    None => self.held = Some(open),
                }
            }
        }
        self.done.extend(self.held.take());
        self.done
    }
}

/// Windows of approximately `chunk_size` tokens, consecutive windows sharing
/// `overlap` tokens. Windows are widened to whole lines.
///
/// Tokens are the non-whitespace Unicode word-boundary segments of the text.
#[derive(Debug, Clone, Copy)]
pub struct TokenStrategy {
    chunk_size: usize,
    overlap: usize,
    min_chars: usize,
}

impl TokenStrategy {
    /// `overlap` is clamped below `chunk_size`.
    #[must_use]
    pub fn new(chunk_size: usize, overlap: usize, min_chars: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
            min_chars,
        }
    }

    #[must_use]
    pub fn from_config(config: &ChunkerConfig) -> Self {
        Self::new(
            config.token_chunk_size,
            config.token_chunk_overlap,
            config.line_min_block_chars,
        )
    }
}

impl ChunkStrategy for TokenStrategy {
    fn name(&self) -> &'static str {
        "tokens"
    }

    fn chunk(&self, text: &str, file_path: &str, file_hash: &str) -> Vec<CodeBlock> {
        let tokens: Vec<(usize, usize)> = text
            .split_word_bound_indices()
            .filter(|(_, word)| !word.trim().is_empty())
            .map(|(offset, word)| (offset, offset + word.len()))
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let index = LineIndex::new(text);
        let step = self.chunk_size - self.overlap;
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut first = 0;
        loop {
            let last = (first + self.chunk_size).min(tokens.len()) - 1;
            let start_line = index.line_of_byte(tokens[first].0);
            let end_line = index.line_of_byte(tokens[last].1 - 1);
            if spans.last() != Some(&(start_line, end_line)) {
                spans.push((start_line, end_line));
            }
            if last + 1 >= tokens.len() {
                break;
            }
            first += step;
        }

        let mut blocks: Vec<CodeBlock> = spans
            .iter()
            .filter_map(|&(start, end)| {
                let content = index.slice(start, end)?;
                (content.trim().chars().count() >= self.min_chars).then(|| {
                    CodeBlock::new(file_path, BlockType::Chunk, start, end, content, file_hash)
                })
            })
            .collect();

        if blocks.is_empty() {
            let last = last_text_line(text, &index);
            if let Some(content) = index.slice(1, last) {
                blocks.push(CodeBlock::new(
                    file_path,
                    BlockType::Chunk,
                    1,
                    last,
                    content,
                    file_hash,
                ));
            }
        }
        blocks
    }
}

/// Grammar extraction through [`BlockExtractor`], with line windows when extraction
/// fails or yields nothing.
#[derive(Debug, Clone)]
pub struct GrammarStrategy {
    extractor: Arc<BlockExtractor>,
    lines: LineStrategy,
}

impl GrammarStrategy {
    #[must_use]
    pub const fn new(extractor: Arc<BlockExtractor>, lines: LineStrategy) -> Self {
        Self { extractor, lines }
    }

    /// Full extraction result, including the line-window fallback.
    #[must_use]
    pub fn extract(&self, text: &str, file_path: &str, file_hash: &str) -> ExtractionResult {
        let started = Instant::now();
        let language = Language::from_path(file_path);
        let result = self.extractor.extract(text, file_path, file_hash, language);
        if result.has_blocks() {
            return result;
        }

        let reason = result
            .error_message
            .clone()
            .unwrap_or_else(|| "extraction produced no blocks".to_string());
        log::debug!("{file_path}: falling back to line windows ({reason})");

        let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::LineWindow);
        metadata.language = result.metadata.language;
        metadata.fallback_parser_used = result.metadata.fallback_parser_used;
        metadata.fallback_reason = Some(reason);
        metadata.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        ExtractionResult::success(self.lines.chunk(text, file_path, file_hash), metadata)
    }
}

impl ChunkStrategy for GrammarStrategy {
    fn name(&self) -> &'static str {
        "grammar"
    }

    fn chunk(&self, text: &str, file_path: &str, file_hash: &str) -> Vec<CodeBlock> {
        self.extract(text, file_path, file_hash).blocks
    }
}
