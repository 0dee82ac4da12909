use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::RwLock;

use lru::LruCache;
use serde::Serialize;
use thiserror::Error;

/// Result type for chunker operations
pub type Result<T> = std::result::Result<T, ChunkerError>;

/// Errors that can occur inside the chunking engine.
///
/// These never cross the public boundary of the extraction entry points; they are
/// converted into [`crate::ExtractionResult`] values or empty block lists there.
#[derive(Error, Debug)]
pub enum ChunkerError {
    /// Failed to parse the source code
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Unsupported language
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error occurred
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Empty content
    #[error("Empty content provided")]
    EmptyContent,

    /// Tree-sitter error
    #[error("Tree-sitter error: {0}")]
    TreeSitterError(String),

    /// A query execution tier failed or is unavailable
    #[error("Query error: {0}")]
    QueryError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ChunkerError {
    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create an unsupported language error
    pub fn unsupported_language(lang: impl Into<String>) -> Self {
        Self::UnsupportedLanguage(lang.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a tree-sitter error
    pub fn tree_sitter(msg: impl Into<String>) -> Self {
        Self::TreeSitterError(msg.into())
    }

    /// Create a query execution error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryError(msg.into())
    }
}

/// Broad classification used when reporting recoverable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Parsing,
    Query,
    FileSystem,
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parsing => "parsing",
            Self::Query => "query",
            Self::FileSystem => "file_system",
            Self::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Reports kept by [`ErrorReporter::new`]
pub const DEFAULT_RETAINED_REPORTS: usize = 256;

/// De-duplication keys remembered by [`ErrorReporter::report_once`]
const SEEN_KEY_CAPACITY: usize = 4096;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub component: &'static str,
    pub operation: &'static str,
    /// De-duplication key, for reports made through `report_once`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub message: String,
}

/// Shared sink for recoverable failures.
///
/// Components never propagate these failures to their callers; they report them here
/// and degrade. Only the most recent reports are retained; older ones are evicted and
/// counted in [`ErrorReporter::dropped`]. Per-category counters cover every report
/// ever made and are never reset.
#[derive(Debug)]
pub struct ErrorReporter {
    inner: RwLock<ReporterState>,
}

#[derive(Debug)]
struct ReporterState {
    reports: VecDeque<ErrorReport>,
    capacity: usize,
    dropped: u64,
    seen_keys: LruCache<String, ()>,
    per_category: HashMap<ErrorCategory, u64>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RETAINED_REPORTS)
    }
}

impl ErrorReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reporter retaining at most `capacity` reports (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(ReporterState {
                reports: VecDeque::with_capacity(capacity.min(DEFAULT_RETAINED_REPORTS)),
                capacity,
                dropped: 0,
                seen_keys: LruCache::new(
                    NonZeroUsize::new(SEEN_KEY_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
                per_category: HashMap::new(),
            }),
        }
    }

    /// Record a failure unconditionally.
    pub fn report(
        &self,
        category: ErrorCategory,
        component: &'static str,
        operation: &'static str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        log::warn!("[{component}::{operation}] {category} failure: {message}");
        let Ok(mut state) = self.inner.write() else {
            return;
        };
        state.push(ErrorReport {
            category,
            component,
            operation,
            key: None,
            message,
        });
    }

    /// Record a failure only the first time `key` is seen.
    ///
    /// Returns `true` when the report was recorded.
    pub fn report_once(
        &self,
        key: &str,
        category: ErrorCategory,
        component: &'static str,
        operation: &'static str,
        message: impl Into<String>,
    ) -> bool {
        let Ok(mut state) = self.inner.write() else {
            return false;
        };
        if state.seen_keys.put(key.to_string(), ()).is_some() {
            log::debug!("[{component}::{operation}] suppressing repeated failure for {key}");
            return false;
        }
        let message = message.into();
        log::warn!("[{component}::{operation}] {category} failure ({key}): {message}");
        state.push(ErrorReport {
            category,
            component,
            operation,
            key: Some(key.to_string()),
            message,
        });
        true
    }

    /// Number of recorded reports in a category.
    #[must_use]
    pub fn count(&self, category: ErrorCategory) -> u64 {
        self.inner
            .read()
            .map(|state| state.per_category.get(&category).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of reports ever recorded, evicted ones included.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.inner
            .read()
            .map(|state| state.reports.len() as u64 + state.dropped)
            .unwrap_or(0)
    }

    /// Reports evicted to stay within the retention capacity.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.read().map(|state| state.dropped).unwrap_or(0)
    }

    /// Copy of the retained reports, oldest first.
    #[must_use]
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.inner
            .read()
            .map(|state| state.reports.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl ReporterState {
    fn push(&mut self, report: ErrorReport) {
        *self.per_category.entry(report.category).or_insert(0) += 1;
        if self.reports.len() == self.capacity {
            self.reports.pop_front();
            self.dropped += 1;
        }
        self.reports.push_back(report);
    }
}
