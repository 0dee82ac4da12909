//! Query execution over a parsed tree.
//!
//! A [`CompiledQuery`] carries up to three [`QueryRunner`]s. They are tried in tier
//! order (captures, matches, cursor walk) and the first one that succeeds wins. Their
//! raw output differs per tier; [`normalize`] turns any of them into [`QueryResults`].

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde::Serialize;
use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Parser, QueryCursor, Tree};

use crate::error::{ChunkerError, ErrorCategory, ErrorReporter, Result};
use crate::language::Language;
use crate::registry::{query_fingerprint, CompiledQuery, GrammarRegistry};
use crate::types::file_hash;

/// In-progress match ceiling for the query-engine tiers
pub const DEFAULT_MATCH_LIMIT: u32 = 1024;

pub const DEFAULT_RESULT_CACHE_ENTRIES: usize = 512;

/// Source position of a node. Lines are 1-based, columns are 0-based byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Span {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
    pub start_byte: usize,
    pub end_byte: usize,
}

impl Span {
    #[must_use]
    pub fn of(node: Node<'_>) -> Self {
        let start = node.start_position();
        let end = node.end_position();
        Self {
            start_line: start.row + 1,
            start_col: start.column,
            end_line: end.row + 1,
            end_col: end.column,
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
        }
    }

    /// Last line holding any of the span's text. A span that ends at column 0 stops
    /// on the previous line.
    #[must_use]
    pub const fn last_content_line(&self) -> usize {
        if self.end_col == 0 && self.end_line > self.start_line {
            self.end_line - 1
        } else {
            self.end_line
        }
    }
}

/// Named sub-captures of one occurrence, e.g. `function` and `function.name`
pub type Occurrence = BTreeMap<String, Span>;

/// Capture group -> occurrences in document order
pub type QueryResults = BTreeMap<String, Vec<Occurrence>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    Captures,
    Matches,
    Cursor,
}

impl fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Captures => "captures",
            Self::Matches => "matches",
            Self::Cursor => "cursor",
        };
        f.write_str(name)
    }
}

/// One capture from the capture stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture {
    pub match_id: u32,
    pub pattern_index: usize,
    pub name: String,
    pub span: Span,
}

/// One pattern match with all of its captures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub pattern_index: usize,
    pub captures: Vec<(String, Span)>,
}

/// One node found by walking the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNode {
    pub group: String,
    pub span: Span,
    pub name: Option<Span>,
}

/// Tier-specific output, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResults {
    Captures(Vec<RawCapture>),
    Matches(Vec<RawMatch>),
    Nodes(Vec<RawNode>),
}

/// One way of executing a compiled query
pub trait QueryRunner: Send + Sync {
    fn tier(&self) -> ExecutionTier;

    fn run_query(
        &self,
        query: &CompiledQuery,
        root: Node<'_>,
        source: &[u8],
    ) -> Result<RawResults>;
}

/// Streams captures in document order
#[derive(Debug, Clone, Copy)]
pub struct CapturesRunner {
    match_limit: u32,
}

impl CapturesRunner {
    #[must_use]
    pub const fn new(match_limit: u32) -> Self {
        Self { match_limit }
    }
}

impl QueryRunner for CapturesRunner {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Captures
    }

    fn run_query(
        &self,
        compiled: &CompiledQuery,
        root: Node<'_>,
        source: &[u8],
    ) -> Result<RawResults> {
        let query = compiled.query();
        let names = query.capture_names();
        let mut cursor = QueryCursor::new();
        cursor.set_match_limit(self.match_limit);

        let mut raw = Vec::new();
        {
            let mut captures = cursor.captures(query, root, source);
            while let Some((query_match, capture_index)) = captures.next() {
                let capture = query_match.captures[*capture_index];
                raw.push(RawCapture {
                    match_id: query_match.id(),
                    pattern_index: query_match.pattern_index,
                    name: names[capture.index as usize].to_string(),
                    span: Span::of(capture.node),
                });
            }
        }

        if cursor.did_exceed_match_limit() {
            return Err(ChunkerError::query("match limit exceeded"));
        }
        Ok(RawResults::Captures(raw))
    }
}

/// Iterates whole matches
#[derive(Debug, Clone, Copy)]
pub struct MatchesRunner {
    match_limit: u32,
}

impl MatchesRunner {
    #[must_use]
    pub const fn new(match_limit: u32) -> Self {
        Self { match_limit }
    }
}

impl QueryRunner for MatchesRunner {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Matches
    }

    fn run_query(
        &self,
        compiled: &CompiledQuery,
        root: Node<'_>,
        source: &[u8],
    ) -> Result<RawResults> {
        let query = compiled.query();
        let names = query.capture_names();
        let mut cursor = QueryCursor::new();
        cursor.set_match_limit(self.match_limit);

        let mut raw = Vec::new();
        {
            let mut matches = cursor.matches(query, root, source);
            while let Some(query_match) = matches.next() {
                raw.push(RawMatch {
                    pattern_index: query_match.pattern_index,
                    captures: query_match
                        .captures
                        .iter()
                        .map(|capture| {
                            (names[capture.index as usize].to_string(), Span::of(capture.node))
                        })
                        .collect(),
                });
            }
        }

        if cursor.did_exceed_match_limit() {
            return Err(ChunkerError::query("match limit exceeded"));
        }
        Ok(RawResults::Matches(raw))
    }
}

/// Walks the tree with a cursor and keeps nodes whose kind has a capture group.
/// Needs no query-engine support.
#[derive(Debug, Clone, Copy)]
pub struct CursorWalkRunner;

impl QueryRunner for CursorWalkRunner {
    fn tier(&self) -> ExecutionTier {
        ExecutionTier::Cursor
    }

    fn run_query(
        &self,
        compiled: &CompiledQuery,
        root: Node<'_>,
        _source: &[u8],
    ) -> Result<RawResults> {
        let mut cursor = root.walk();
        let mut nodes = Vec::new();

        loop {
            let node = cursor.node();
            if let Some(group) = compiled.group_for_node(node.kind()) {
                let name = node
                    .child_by_field_name("name")
                    .or_else(|| node.child_by_field_name("type"));
                nodes.push(RawNode {
                    group: group.to_string(),
                    span: Span::of(node),
                    name: name.map(Span::of),
                });
            }

            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return Ok(RawResults::Nodes(nodes));
                }
            }
        }
    }
}

/// Convert tier output into the canonical shape.
///
/// The capture without a `.` names the group and is required; occurrences without it
/// are dropped. Sub-captures of other groups are ignored.
#[must_use]
pub fn normalize(raw: RawResults) -> QueryResults {
    let occurrences: Vec<Vec<(String, Span)>> = match raw {
        RawResults::Captures(captures) => group_captures(captures),
        RawResults::Matches(matches) => matches.into_iter().map(|m| m.captures).collect(),
        RawResults::Nodes(nodes) => nodes
            .into_iter()
            .map(|node| {
                let mut captures = Vec::with_capacity(2);
                if let Some(name) = node.name {
                    captures.push((format!("{}.name", node.group), name));
                }
                captures.push((node.group, node.span));
                captures
            })
            .collect(),
    };

    let mut results = QueryResults::new();
    for captures in occurrences {
        let Some(group) = captures
            .iter()
            .find(|(name, _)| !name.contains('.'))
            .map(|(name, _)| name.clone())
        else {
            continue;
        };

        let mut occurrence = Occurrence::new();
        for (name, span) in captures {
            let belongs = name == group
                || name
                    .strip_prefix(group.as_str())
                    .is_some_and(|rest| rest.starts_with('.'));
            if belongs {
                occurrence.entry(name).or_insert(span);
            }
        }
        results.entry(group).or_default().push(occurrence);
    }

    for (group, occurrences) in &mut results {
        occurrences.sort_by_key(|occurrence| {
            occurrence
                .get(group)
                .map(|span| (span.start_byte, Reverse(span.end_byte)))
        });
        occurrences.dedup();
    }
    results
}

fn group_captures(captures: Vec<RawCapture>) -> Vec<Vec<(String, Span)>> {
    let mut order = Vec::new();
    let mut grouped: HashMap<(u32, usize), Vec<(String, Span)>> = HashMap::new();
    for capture in captures {
        let key = (capture.match_id, capture.pattern_index);
        grouped
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push((capture.name, capture.span));
    }
    order
        .into_iter()
        .filter_map(|key| grouped.remove(&key))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResultKey {
    language: Language,
    query_source: String,
    /// Hash of the parsed source
    fingerprint: String,
}

/// Runs compiled queries and caches normalized results per
/// `(language, query, content)`.
pub struct QueryExecutor {
    registry: Arc<GrammarRegistry>,
    errors: Arc<ErrorReporter>,
    results: Mutex<LruCache<ResultKey, Arc<QueryResults>>>,
}

impl fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("cached_results", &self.cached_results())
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    pub fn new(registry: Arc<GrammarRegistry>, errors: Arc<ErrorReporter>) -> Self {
        Self::with_capacity(registry, errors, DEFAULT_RESULT_CACHE_ENTRIES)
    }

    pub fn with_capacity(
        registry: Arc<GrammarRegistry>,
        errors: Arc<ErrorReporter>,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            errors,
            results: Mutex::new(LruCache::new(capacity)),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<GrammarRegistry> {
        &self.registry
    }

    /// Parse `source` and run `query_source` over it.
    ///
    /// `None` means "no usable result": blank input, no grammar, a parse failure or
    /// every tier failing. Callers fall back to non-grammar chunking.
    pub fn run(
        &self,
        source: &str,
        query_source: &str,
        parser: &mut Parser,
        language: Language,
    ) -> Option<Arc<QueryResults>> {
        if source.trim().is_empty() {
            return None;
        }

        let key = ResultKey {
            language,
            query_source: query_source.to_string(),
            fingerprint: file_hash(source),
        };
        if let Some(hit) = self.cached(&key) {
            log::debug!("Query result cache hit for {}", language.as_str());
            return Some(hit);
        }

        let compiled = self.registry.compile_for(language, query_source)?;
        let tree = match parse(source, parser, language) {
            Ok(tree) => tree,
            Err(e) => {
                self.errors.report(
                    ErrorCategory::Parsing,
                    "executor",
                    "parse",
                    format!("{}: {e}", language.as_str()),
                );
                return None;
            }
        };

        let root = tree.root_node();
        let mut failures = Vec::new();
        let mut results = None;
        for runner in compiled.runners() {
            match runner.run_query(&compiled, root, source.as_bytes()) {
                Ok(raw) => {
                    results = Some(normalize(raw));
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "{} tier failed for {}, trying next tier: {e}",
                        runner.tier(),
                        language.as_str()
                    );
                    failures.push(format!("{}: {e}", runner.tier()));
                }
            }
        }

        let Some(results) = results else {
            self.errors.report_once(
                &format!(
                    "execute:{}:{}",
                    language.as_str(),
                    query_fingerprint(query_source)
                ),
                ErrorCategory::Query,
                "executor",
                "run",
                format!("all execution tiers failed ({})", failures.join("; ")),
            );
            return None;
        };

        let results = Arc::new(results);
        if let Ok(mut cache) = self.results.lock() {
            cache.put(key, results.clone());
        }
        Some(results)
    }

    fn cached(&self, key: &ResultKey) -> Option<Arc<QueryResults>> {
        self.results.lock().ok()?.get(key).cloned()
    }

    /// Drop cached results of one language.
    pub fn invalidate(&self, language: Language) {
        if let Ok(mut cache) = self.results.lock() {
            let stale: Vec<ResultKey> = cache
                .iter()
                .filter(|(key, _)| key.language == language)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                cache.pop(key);
            }
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.results.lock() {
            cache.clear();
        }
    }

    #[must_use]
    pub fn cached_results(&self) -> usize {
        self.results.lock().map(|cache| cache.len()).unwrap_or(0)
    }
}

fn parse(source: &str, parser: &mut Parser, language: Language) -> Result<Tree> {
    let ts_language = language.tree_sitter_language()?;
    parser
        .set_language(&ts_language)
        .map_err(|e| ChunkerError::tree_sitter(format!("Failed to set language: {e}")))?;
    parser
        .parse(source, None)
        .ok_or_else(|| ChunkerError::parse("Failed to parse source code"))
}
