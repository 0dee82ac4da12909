//! Size-aware reading for large files.
//!
//! Small files go through the [`FileAcquirer`] whole. Larger files are split into
//! fixed-size byte chunks, decoded as UTF-8 with multi-byte sequences carried across
//! chunk boundaries, either collected (chunked) or handed to a callback as they are
//! read (streaming).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::acquirer::FileAcquirer;
use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, ErrorCategory, ErrorReporter, Result};

const MIB: u64 = 1024 * 1024;

/// Smallest chunk the reader will use; one UTF-8 scalar always fits.
const MIN_CHUNK_BYTES: u64 = 4;

/// Estimated peak memory per byte of file, per strategy
const STANDARD_MEMORY_FACTOR: f64 = 3.0;
const CHUNKED_MEMORY_FACTOR: f64 = 1.5;
const STREAMING_MEMORY_FACTOR: f64 = 0.1;

/// How a file is brought into memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStrategy {
    /// Whole-file acquisition
    Standard,
    /// Every chunk collected before processing
    Chunked,
    /// Chunks processed as they are read
    Streaming,
}

impl ReadStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Chunked => "chunked",
            Self::Streaming => "streaming",
        }
    }

    const fn memory_factor(self) -> f64 {
        match self {
            Self::Standard => STANDARD_MEMORY_FACTOR,
            Self::Chunked => CHUNKED_MEMORY_FACTOR,
            Self::Streaming => STREAMING_MEMORY_FACTOR,
        }
    }

    /// This strategy and every cheaper one, most expensive first
    fn with_cheaper(self) -> &'static [Self] {
        match self {
            Self::Standard => &[Self::Standard, Self::Chunked, Self::Streaming],
            Self::Chunked => &[Self::Chunked, Self::Streaming],
            Self::Streaming => &[Self::Streaming],
        }
    }
}

/// Reader settings taken from [`ChunkerConfig`]
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub large_file_threshold_bytes: u64,
    pub streaming_threshold_bytes: u64,
    pub default_chunk_size_bytes: u64,
    pub max_chunk_size_bytes: u64,
    pub language_chunk_sizes: BTreeMap<String, u64>,
}

impl From<&ChunkerConfig> for ReaderSettings {
    fn from(config: &ChunkerConfig) -> Self {
        Self {
            large_file_threshold_bytes: config.large_file_threshold_bytes,
            streaming_threshold_bytes: config.streaming_threshold_bytes,
            default_chunk_size_bytes: config.default_chunk_size_bytes,
            max_chunk_size_bytes: config.max_chunk_size_bytes,
            language_chunk_sizes: config.language_chunk_sizes.clone(),
        }
    }
}

/// One decoded chunk of a file
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub index: usize,
    pub data: String,
    /// Raw bytes consumed from the file so far, this chunk included
    pub bytes_read: u64,
    pub total_size: u64,
    /// Fraction of the file consumed, `0.0..=1.0`
    pub progress: f64,
    pub is_last: bool,
}

/// Summary of a chunked or streamed pass over a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamOutcome {
    pub success: bool,
    pub chunks_processed: usize,
    pub bytes_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// [`StreamOutcome`] of a memory-budgeted pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetOutcome {
    #[serde(flatten)]
    pub outcome: StreamOutcome,
    pub strategy_used: ReadStrategy,
    pub estimated_memory_bytes: u64,
    pub budget_bytes: u64,
    /// Bytes by which even streaming exceeds the budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct ScalableReader {
    settings: ReaderSettings,
    acquirer: Arc<FileAcquirer>,
    errors: Arc<ErrorReporter>,
}

impl ScalableReader {
    pub fn new(
        settings: ReaderSettings,
        acquirer: Arc<FileAcquirer>,
        errors: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            settings,
            acquirer,
            errors,
        }
    }

    #[must_use]
    pub fn choose_strategy(&self, file_size: u64, language: Option<&str>) -> ReadStrategy {
        let strategy = if file_size < self.settings.large_file_threshold_bytes {
            ReadStrategy::Standard
        } else if file_size < self.settings.streaming_threshold_bytes {
            ReadStrategy::Chunked
        } else {
            ReadStrategy::Streaming
        };
        log::debug!(
            "Read strategy for {file_size} bytes ({}): {}",
            language.unwrap_or("unknown"),
            strategy.as_str()
        );
        strategy
    }

    /// Per-language base size scaled up for very large files, capped at the max chunk size.
    #[must_use]
    pub fn optimal_chunk_size(&self, file_size: u64, language: Option<&str>) -> u64 {
        let base = language
            .and_then(|lang| {
                self.settings
                    .language_chunk_sizes
                    .get(&lang.to_ascii_lowercase())
            })
            .copied()
            .unwrap_or(self.settings.default_chunk_size_bytes);

        let scale = match file_size {
            size if size < MIB => 1,
            size if size < 10 * MIB => 2,
            size if size < 100 * MIB => 4,
            _ => 8,
        };

        base.saturating_mul(scale)
            .min(self.settings.max_chunk_size_bytes)
            .max(MIN_CHUNK_BYTES)
    }

    /// Lazily read `path` in chunks of `chunk_size` bytes.
    ///
    /// Errors (including failing to open the file) are yielded once, after which the
    /// iterator ends.
    pub fn load_chunked(&self, path: &Path, chunk_size: Option<u64>) -> ChunkIter {
        let opened = File::open(path).and_then(|file| {
            let total = file.metadata()?.len();
            Ok((file, total))
        });
        match opened {
            Ok((file, total_size)) => {
                let chunk_size =
                    chunk_size.unwrap_or_else(|| self.optimal_chunk_size(total_size, None));
                ChunkIter::new(file, total_size, chunk_size)
            }
            Err(e) => ChunkIter::failed(e.into()),
        }
    }

    /// Read `path` chunk by chunk, calling `on_chunk(data, index, is_last)` as each
    /// chunk is read. The whole file is never held in memory.
    pub fn stream_process<F>(
        &self,
        path: &Path,
        mut on_chunk: F,
        chunk_size: Option<u64>,
    ) -> StreamOutcome
    where
        F: FnMut(&str, usize, bool),
    {
        let mut outcome = StreamOutcome {
            success: true,
            ..Default::default()
        };

        for record in self.load_chunked(path, chunk_size) {
            match record {
                Ok(record) => {
                    on_chunk(&record.data, record.index, record.is_last);
                    outcome.chunks_processed += 1;
                    outcome.bytes_processed = record.bytes_read;
                }
                Err(e) => {
                    self.fail(&mut outcome, path, "stream_process", &e);
                    break;
                }
            }
        }

        outcome
    }

    /// Process `path` with the most capable strategy whose estimated memory fits
    /// `max_memory_mb`. When nothing fits, streams anyway and reports the shortfall.
    pub fn process_with_memory_budget<F>(
        &self,
        path: &Path,
        mut on_chunk: F,
        max_memory_mb: u64,
    ) -> BudgetOutcome
    where
        F: FnMut(&str, usize, bool),
    {
        let budget_bytes = max_memory_mb.saturating_mul(MIB);
        let file_size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                let mut outcome = StreamOutcome::default();
                self.fail(&mut outcome, path, "process_with_memory_budget", &e.into());
                return BudgetOutcome {
                    outcome,
                    strategy_used: ReadStrategy::Standard,
                    estimated_memory_bytes: 0,
                    budget_bytes,
                    shortfall_bytes: None,
                };
            }
        };

        let preferred = self.choose_strategy(file_size, None);
        let fitting = preferred
            .with_cheaper()
            .iter()
            .copied()
            .find(|strategy| estimate_memory(*strategy, file_size) <= budget_bytes);

        let (strategy, shortfall_bytes) = match fitting {
            Some(strategy) => (strategy, None),
            None => {
                let estimate = estimate_memory(ReadStrategy::Streaming, file_size);
                log::debug!(
                    "{} needs ~{estimate} bytes, over the {budget_bytes} byte budget; streaming anyway",
                    path.display()
                );
                (ReadStrategy::Streaming, Some(estimate - budget_bytes))
            }
        };

        let outcome = match strategy {
            ReadStrategy::Standard => {
                let content = self.acquirer.read(path, Some(file_size));
                on_chunk(&content, 0, true);
                StreamOutcome {
                    success: true,
                    chunks_processed: 1,
                    bytes_processed: content.len() as u64,
                    error: None,
                }
            }
            ReadStrategy::Chunked => self.process_collected(path, file_size, &mut on_chunk),
            ReadStrategy::Streaming => {
                let chunk_size = self.optimal_chunk_size(file_size, None);
                self.stream_process(path, on_chunk, Some(chunk_size))
            }
        };

        BudgetOutcome {
            outcome,
            strategy_used: strategy,
            estimated_memory_bytes: estimate_memory(strategy, file_size),
            budget_bytes,
            shortfall_bytes,
        }
    }

    fn process_collected<F>(&self, path: &Path, file_size: u64, on_chunk: &mut F) -> StreamOutcome
    where
        F: FnMut(&str, usize, bool),
    {
        let chunk_size = self.optimal_chunk_size(file_size, None);
        let records: Result<Vec<ChunkRecord>> = self.load_chunked(path, Some(chunk_size)).collect();
        match records {
            Ok(records) => {
                for record in &records {
                    on_chunk(&record.data, record.index, record.is_last);
                }
                StreamOutcome {
                    success: true,
                    chunks_processed: records.len(),
                    bytes_processed: records.last().map_or(0, |r| r.bytes_read),
                    error: None,
                }
            }
            Err(e) => {
                let mut outcome = StreamOutcome::default();
                self.fail(&mut outcome, path, "load_chunked", &e);
                outcome
            }
        }
    }

    fn fail(&self, outcome: &mut StreamOutcome, path: &Path, operation: &'static str, e: &ChunkerError) {
        let message = format!("{}: {e}", path.display());
        self.errors
            .report(ErrorCategory::FileSystem, "reader", operation, message.clone());
        outcome.success = false;
        outcome.error = Some(message);
    }
}

fn estimate_memory(strategy: ReadStrategy, file_size: u64) -> u64 {
    (file_size as f64 * strategy.memory_factor()).ceil() as u64
}

/// Iterator over the decoded chunks of one file
#[derive(Debug)]
pub struct ChunkIter {
    reader: Option<BufReader<File>>,
    pending_error: Option<ChunkerError>,
    chunk_size: usize,
    total_size: u64,
    bytes_read: u64,
    index: usize,
    /// Incomplete UTF-8 sequence left over from the previous chunk
    carry: Vec<u8>,
    lookahead: Option<Vec<u8>>,
}

impl ChunkIter {
    fn new(file: File, total_size: u64, chunk_size: u64) -> Self {
        let chunk_size = usize::try_from(chunk_size.max(MIN_CHUNK_BYTES)).unwrap_or(usize::MAX);
        Self {
            reader: Some(BufReader::new(file)),
            pending_error: None,
            chunk_size,
            total_size,
            bytes_read: 0,
            index: 0,
            carry: Vec::new(),
            lookahead: None,
        }
    }

    fn failed(error: ChunkerError) -> Self {
        Self {
            reader: None,
            pending_error: Some(error),
            chunk_size: MIN_CHUNK_BYTES as usize,
            total_size: 0,
            bytes_read: 0,
            index: 0,
            carry: Vec::new(),
            lookahead: None,
        }
    }

    fn read_block(&mut self) -> Result<Vec<u8>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(Vec::new());
        };
        let mut block = Vec::with_capacity(self.chunk_size);
        reader
            .by_ref()
            .take(self.chunk_size as u64)
            .read_to_end(&mut block)?;
        Ok(block)
    }

    fn next_record(&mut self) -> Result<Option<ChunkRecord>> {
        let current = match self.lookahead.take() {
            Some(block) => block,
            None => self.read_block()?,
        };
        if current.is_empty() && self.carry.is_empty() {
            self.reader = None;
            return Ok(None);
        }
        self.bytes_read += current.len() as u64;

        let next = self.read_block()?;
        let is_last = next.is_empty();
        if !is_last {
            self.lookahead = Some(next);
        }

        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(&current);
        if !is_last {
            let split = incomplete_tail_start(&bytes);
            self.carry = bytes.split_off(split);
        }
        let data = String::from_utf8_lossy(&bytes).into_owned();

        let progress = if is_last || self.total_size == 0 {
            1.0
        } else {
            (self.bytes_read as f64 / self.total_size as f64).min(1.0)
        };

        let record = ChunkRecord {
            index: self.index,
            data,
            bytes_read: self.bytes_read,
            total_size: self.total_size,
            progress,
            is_last,
        };
        self.index += 1;
        if is_last {
            self.reader = None;
        }
        Ok(Some(record))
    }
}

impl Iterator for ChunkIter {
    type Item = Result<ChunkRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(error) = self.pending_error.take() {
            return Some(Err(error));
        }
        if self.reader.is_none() && self.lookahead.is_none() {
            return None;
        }
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.reader = None;
                self.lookahead = None;
                Some(Err(e))
            }
        }
    }
}

/// Start of a trailing UTF-8 sequence that is cut off by the end of `bytes`, or
/// `bytes.len()` when the buffer ends on a sequence boundary.
fn incomplete_tail_start(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let idx = len - back;
        let byte = bytes[idx];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { idx } else { len };
    }
    len
}
