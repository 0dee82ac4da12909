use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::acquirer::{looks_binary, AcquirerSettings, FileAcquirer};
use crate::config::{ChunkerConfig, ChunkingStrategy};
use crate::error::{ChunkerError, ErrorCategory, ErrorReporter, Result};
use crate::executor::QueryExecutor;
use crate::extractor::BlockExtractor;
use crate::fallback::{FallbackParser, HybridFallbackChain, ParserInfo};
use crate::language::Language;
use crate::metrics::{ReadMetrics, ReadMetricsSnapshot};
use crate::reader::{ReadStrategy, ReaderSettings, ScalableReader};
use crate::registry::{GrammarRegistry, LanguageProfile, NativeBinding, QueryBinding};
use crate::strategy::{ChunkStrategy, GrammarStrategy, LineStrategy, TokenStrategy};
use crate::types::{file_hash, CodeBlock, ExtractionResult};

/// Main entry point: owns the shared context (metrics, error reporter, registry,
/// caches) and runs the configured strategy over text or files.
///
/// Every method is infallible from the caller's point of view; failures are
/// recorded in [`Chunker::errors`] and degrade to fallback output or empty lists.
pub struct Chunker {
    config: ChunkerConfig,
    errors: Arc<ErrorReporter>,
    acquirer: Arc<FileAcquirer>,
    reader: ScalableReader,
    registry: Arc<GrammarRegistry>,
    executor: Arc<QueryExecutor>,
    extractor: Arc<BlockExtractor>,
    grammar: GrammarStrategy,
    strategy: Box<dyn ChunkStrategy>,
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunker")
            .field("strategy", &self.strategy.name())
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// One file for [`Chunker::chunk_batch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInput {
    pub file_path: String,
    pub text: String,
    #[serde(default)]
    pub file_hash: Option<String>,
}

impl BatchInput {
    pub fn new(file_path: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            text: text.into(),
            file_hash: None,
        }
    }
}

impl Chunker {
    /// Create a chunker. An invalid configuration is reported under
    /// [`ErrorCategory::Configuration`] and replaced by the defaults; use
    /// [`Chunker::try_new`] to reject it instead.
    #[must_use]
    pub fn new(config: ChunkerConfig) -> Self {
        match config.validate() {
            Ok(()) => Self::assemble(config, Arc::new(NativeBinding::default())),
            Err(e) => {
                let chunker =
                    Self::assemble(ChunkerConfig::default(), Arc::new(NativeBinding::default()));
                chunker.errors.report(
                    ErrorCategory::Configuration,
                    "chunker",
                    "new",
                    format!("invalid configuration, using defaults: {e}"),
                );
                chunker
            }
        }
    }

    pub fn try_new(config: ChunkerConfig) -> Result<Self> {
        Self::with_binding(config, Arc::new(NativeBinding::default()))
    }

    /// Create a chunker whose registry compiles queries through `binding`.
    pub fn with_binding(config: ChunkerConfig, binding: Arc<dyn QueryBinding>) -> Result<Self> {
        config.validate().map_err(ChunkerError::invalid_config)?;
        Ok(Self::assemble(config, binding))
    }

    fn assemble(config: ChunkerConfig, binding: Arc<dyn QueryBinding>) -> Self {
        let errors = Arc::new(ErrorReporter::new());
        let metrics = Arc::new(ReadMetrics::new());
        let acquirer = Arc::new(FileAcquirer::new(
            AcquirerSettings::from(&config),
            metrics,
            errors.clone(),
        ));
        let reader = ScalableReader::new(
            ReaderSettings::from(&config),
            acquirer.clone(),
            errors.clone(),
        );
        let registry = Arc::new(GrammarRegistry::with_binding(
            &config,
            errors.clone(),
            binding,
        ));
        let executor = Arc::new(QueryExecutor::new(registry.clone(), errors.clone()));
        let fallback = Arc::new(HybridFallbackChain::new(&config));
        let extractor = Arc::new(BlockExtractor::new(
            &config,
            executor.clone(),
            fallback,
            errors.clone(),
        ));

        let lines = LineStrategy::from_config(&config);
        let grammar = GrammarStrategy::new(extractor.clone(), lines);
        let strategy: Box<dyn ChunkStrategy> = match config.effective_strategy() {
            ChunkingStrategy::Lines => Box::new(lines),
            ChunkingStrategy::Tokens => Box::new(TokenStrategy::from_config(&config)),
            ChunkingStrategy::Grammar => Box::new(grammar.clone()),
        };
        log::debug!("Chunker ready with the {} strategy", strategy.name());

        Self {
            config,
            errors,
            acquirer,
            reader,
            registry,
            executor,
            extractor,
            grammar,
            strategy,
        }
    }

    /// Chunk `text` with the configured strategy.
    #[must_use]
    pub fn chunk(&self, text: &str, file_path: &str, file_hash: &str) -> Vec<CodeBlock> {
        if text.is_empty() {
            return Vec::new();
        }
        self.strategy.chunk(text, file_path, file_hash)
    }

    /// Grammar extraction with its diagnostics, regardless of the configured
    /// strategy. Falls back to line windows exactly like the grammar strategy.
    #[must_use]
    pub fn extract(&self, text: &str, file_path: &str, file_hash: &str) -> ExtractionResult {
        self.grammar.extract(text, file_path, file_hash)
    }

    /// Read and chunk a file. Unreadable or binary files yield no blocks.
    ///
    /// Files at or above the streaming threshold are never held in memory whole; they
    /// are cut into line windows as they stream in.
    pub fn chunk_file(&self, path: impl AsRef<Path>) -> Vec<CodeBlock> {
        let path = path.as_ref();
        let file_path = path.to_string_lossy().into_owned();
        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.errors.report(
                    ErrorCategory::FileSystem,
                    "chunker",
                    "chunk_file",
                    format!("{file_path}: {e}"),
                );
                return Vec::new();
            }
        };

        let language = Language::from_path(path);
        let language_key = (language != Language::Unknown).then(|| language.as_str());
        match self.reader.choose_strategy(size, language_key) {
            ReadStrategy::Standard => {
                let content = self.acquirer.read(path, Some(size));
                self.chunk_content(&content, &file_path)
            }
            ReadStrategy::Chunked => {
                let chunk_size = self.reader.optimal_chunk_size(size, language_key);
                let mut content = String::with_capacity(usize::try_from(size).unwrap_or(0));
                for record in self.reader.load_chunked(path, Some(chunk_size)) {
                    match record {
                        Ok(record) => content.push_str(&record.data),
                        Err(e) => {
                            self.errors.report(
                                ErrorCategory::FileSystem,
                                "chunker",
                                "chunk_file",
                                format!("{file_path}: {e}"),
                            );
                            return Vec::new();
                        }
                    }
                }
                self.chunk_content(&content, &file_path)
            }
            ReadStrategy::Streaming => self.chunk_streamed(path, &file_path, size, language_key),
        }
    }

    fn chunk_content(&self, content: &str, file_path: &str) -> Vec<CodeBlock> {
        if content.is_empty() {
            return Vec::new();
        }
        if looks_binary(content.as_bytes()) {
            log::debug!("{file_path}: binary content, no blocks");
            return Vec::new();
        }
        self.chunk(content, file_path, &file_hash(content))
    }

    fn chunk_streamed(
        &self,
        path: &Path,
        file_path: &str,
        size: u64,
        language_key: Option<&str>,
    ) -> Vec<CodeBlock> {
        let chunk_size = self.reader.optimal_chunk_size(size, language_key);

        let mut hasher = Sha256::new();
        let mut windower = LineStrategy::from_config(&self.config).windower();
        let mut pending = String::new();
        let mut binary = false;

        let outcome = self.reader.stream_process(
            path,
            |data, index, is_last| {
                hasher.update(data.as_bytes());
                if index == 0 && looks_binary(data.as_bytes()) {
                    binary = true;
                }
                if binary {
                    return;
                }

                // Only whole lines reach the windower; the open window carries over
                // from one segment to the next.
                pending.push_str(data);
                if let Some(cut) = pending.rfind('\n') {
                    let rest = pending.split_off(cut + 1);
                    for line in pending[..cut].split('\n') {
                        windower.push_line(line);
                    }
                    pending = rest;
                }
                if is_last && !pending.is_empty() {
                    windower.push_line(&pending);
                    pending.clear();
                }
            },
            Some(chunk_size),
        );

        if !outcome.success || binary {
            return Vec::new();
        }

        let hash = format!("{:x}", hasher.finalize());
        let blocks: Vec<CodeBlock> = windower
            .finish()
            .into_iter()
            .map(|window| window.into_block(file_path, &hash))
            .collect();
        log::debug!(
            "{file_path}: streamed {} chunks into {} blocks",
            outcome.chunks_processed,
            blocks.len()
        );
        blocks
    }

    /// Chunk many in-memory files, grouped by language so each language's query is
    /// compiled once. Keyed by file path.
    #[must_use]
    pub fn chunk_batch(&self, files: &[BatchInput]) -> BTreeMap<String, Vec<CodeBlock>> {
        let mut groups: BTreeMap<&'static str, Vec<&BatchInput>> = BTreeMap::new();
        for file in files {
            groups
                .entry(Language::from_path(&file.file_path).as_str())
                .or_default()
                .push(file);
        }

        let mut results = BTreeMap::new();
        for (language_key, group) in groups {
            let language = Language::from_name(language_key);
            if let Some(profile) = self.registry.profile(language) {
                if self
                    .registry
                    .compile_for(language, &profile.query_source)
                    .is_none()
                {
                    log::debug!("No compiled query for {language_key}; batch uses fallbacks");
                }
            }

            for file in group {
                let hash = file
                    .file_hash
                    .clone()
                    .unwrap_or_else(|| file_hash(&file.text));
                results.insert(
                    file.file_path.clone(),
                    self.chunk(&file.text, &file.file_path, &hash),
                );
            }
        }
        results
    }

    #[must_use]
    pub const fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Recoverable failures recorded so far
    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorReporter> {
        &self.errors
    }

    #[must_use]
    pub fn read_metrics(&self) -> ReadMetricsSnapshot {
        self.acquirer.metrics().snapshot()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<GrammarRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    #[must_use]
    pub const fn reader(&self) -> &ScalableReader {
        &self.reader
    }

    /// Replace a language profile and drop everything cached for that language.
    pub fn override_profile(&self, language: &str, profile: LanguageProfile) -> Result<()> {
        self.registry.override_profile(language, profile)?;
        self.executor.invalidate(Language::from_name(language));
        Ok(())
    }

    /// Append a parser to the fallback chain, after the built-in parsers.
    pub fn register_fallback_parser(&self, parser: Arc<dyn FallbackParser>) {
        self.extractor.fallback().register(parser);
    }

    #[must_use]
    pub fn available_fallback_parsers(&self) -> Vec<ParserInfo> {
        self.extractor.fallback().available_parsers()
    }

    /// Get statistics about a block list
    #[must_use]
    pub fn get_stats(blocks: &[CodeBlock]) -> ChunkingStats {
        let sizes: Vec<usize> = blocks.iter().map(|b| b.content.chars().count()).collect();
        let total_chars: usize = sizes.iter().sum();
        let mut per_type = BTreeMap::new();
        for block in blocks {
            *per_type.entry(block.block_type.as_str().to_string()).or_insert(0) += 1;
        }

        ChunkingStats {
            total_blocks: blocks.len(),
            total_lines: blocks.iter().map(CodeBlock::line_count).sum(),
            total_chars,
            avg_chars_per_block: if blocks.is_empty() {
                0
            } else {
                total_chars / blocks.len()
            },
            min_chars: sizes.iter().copied().min().unwrap_or(0),
            max_chars: sizes.iter().copied().max().unwrap_or(0),
            per_type,
        }
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

/// Statistics about chunking results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChunkingStats {
    pub total_blocks: usize,
    pub total_lines: usize,
    pub total_chars: usize,
    pub avg_chars_per_block: usize,
    pub min_chars: usize,
    pub max_chars: usize,
    /// Block type name -> count
    pub per_type: BTreeMap<String, usize>,
}

impl fmt::Display for ChunkingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blocks: {} | Lines: {} | Chars: {} | Avg: {} | Range: {}-{}",
            self.total_blocks,
            self.total_lines,
            self.total_chars,
            self.avg_chars_per_block,
            self.min_chars,
            self.max_chars
        )?;
        for (block_type, count) in &self.per_type {
            write!(f, " | {block_type}: {count}")?;
        }
        Ok(())
    }
}
