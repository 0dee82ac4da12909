//! # Code Index Chunker
//!
//! Turns source files into semantic blocks (functions, classes, impl blocks,
//! config sections, text windows) for code indexing and embedding pipelines.
//!
//! ## Architecture
//!
//! ```text
//! File path
//!     │
//!     ├──> FileAcquirer (mapped read, buffered fallback) / ScalableReader
//!     │    └─> standard | chunked | streaming, chosen by file size
//!     │
//!     ├──> Strategy (lines | tokens | grammar)
//!     │
//!     └──> BlockExtractor (grammar strategy)
//!          ├─> GrammarRegistry: profiles + compiled-query cache
//!          ├─> QueryExecutor: captures → matches → cursor tiers, result cache
//!          ├─> caps, overlap and size filters
//!          └─> HybridFallbackChain: config sections, plain text, custom parsers
//! ```
//!
//! Nothing here fails across the public boundary: failures are recorded in an
//! [`ErrorReporter`] and degrade to fallback output or empty block lists.
//!
//! ## Example
//!
//! ```rust
//! use code_index_chunker::{file_hash, BlockType, Chunker, ChunkerConfig};
//!
//! let chunker = Chunker::new(ChunkerConfig::default());
//!
//! let code = r#"
//! fn process_data(input: &str) -> String {
//!     let cleaned = input.trim();
//!     cleaned.to_uppercase()
//! }
//! "#;
//!
//! let blocks = chunker.chunk(code, "src/process.rs", &file_hash(code));
//! assert_eq!(blocks[0].block_type, BlockType::Function);
//! assert_eq!(blocks[0].identifier, "process_data");
//! ```

mod acquirer;
mod chunker;
mod config;
mod error;
mod executor;
mod extractor;
mod fallback;
mod language;
mod metrics;
mod queries;
mod reader;
mod registry;
mod strategy;
mod types;

pub use acquirer::{
    decode_lossy, looks_binary, AcquirerSettings, FileAcquirer, MAX_MAPPED_FILE_BYTES,
};
pub use chunker::{BatchInput, Chunker, ChunkingStats};
pub use config::{ChunkerConfig, ChunkingStrategy, LanguageLimits};
pub use error::{
    ChunkerError, ErrorCategory, ErrorReport, ErrorReporter, Result, DEFAULT_RETAINED_REPORTS,
};
pub use executor::{
    normalize, CapturesRunner, CursorWalkRunner, ExecutionTier, MatchesRunner, Occurrence,
    QueryExecutor, QueryResults, QueryRunner, RawCapture, RawMatch, RawNode, RawResults, Span,
    DEFAULT_MATCH_LIMIT, DEFAULT_RESULT_CACHE_ENTRIES,
};
pub use extractor::BlockExtractor;
pub use fallback::{
    ConfigSectionParser, FallbackParser, HybridFallbackChain, ParserInfo, PlainTextParser,
    NO_PARSER_MESSAGE,
};
pub use language::Language;
pub use metrics::{current_platform, PlatformTally, ReadMetrics, ReadMetricsSnapshot};
pub use queries::{GrammarDefinition, GRAMMARS};
pub use reader::{
    BudgetOutcome, ChunkIter, ChunkRecord, ReadStrategy, ReaderSettings, ScalableReader,
    StreamOutcome,
};
pub use registry::{CompiledQuery, GrammarRegistry, LanguageProfile, NativeBinding, QueryBinding};
pub use strategy::{ChunkStrategy, GrammarStrategy, LineStrategy, TokenStrategy};
pub use types::{
    file_hash, line_span, segment_hash, BlockType, CodeBlock, ExtractionMetadata,
    ExtractionMethod, ExtractionResult, LineIndex,
};
