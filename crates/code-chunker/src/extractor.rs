//! Block extraction: grammar queries first, the fallback chain otherwise.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use globset::GlobSet;
use tree_sitter::Parser;

use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, ErrorCategory, ErrorReporter};
use crate::executor::{QueryExecutor, QueryResults};
use crate::fallback::{compile_globs, normalize_path, HybridFallbackChain};
use crate::language::Language;
use crate::registry::LanguageProfile;
use crate::strategy::line_windows;
use crate::types::{
    BlockType, CodeBlock, ExtractionMetadata, ExtractionMethod, ExtractionResult, LineIndex,
};

const TEST_MARKERS: [&str; 4] = ["test", "tests", "spec", "_test"];
const EXAMPLE_MARKERS: [&str; 3] = ["example", "sample", "demo"];
const EXAMPLE_DIRS: [&str; 6] = ["example", "examples", "sample", "samples", "demo", "demos"];

/// Turns one file into blocks, via grammar queries when possible and the fallback
/// chain otherwise. Never fails: every outcome is an [`ExtractionResult`].
#[derive(Debug)]
pub struct BlockExtractor {
    executor: Arc<QueryExecutor>,
    fallback: Arc<HybridFallbackChain>,
    errors: Arc<ErrorReporter>,
    skip_globs: GlobSet,
    min_block_chars: usize,
    line_max_chars: usize,
    line_min_chars: usize,
}

/// A grammar occurrence before filtering
#[derive(Debug)]
struct Candidate {
    block_type: BlockType,
    start_line: usize,
    end_line: usize,
    identifier: String,
}

#[derive(Debug, Default)]
struct DropCounts {
    too_small: usize,
    overlapping: usize,
    over_cap: usize,
    malformed: usize,
    unmapped: usize,
}

impl BlockExtractor {
    #[must_use]
    pub fn new(
        config: &ChunkerConfig,
        executor: Arc<QueryExecutor>,
        fallback: Arc<HybridFallbackChain>,
        errors: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            executor,
            fallback,
            errors,
            skip_globs: compile_globs(&config.grammar_skip_patterns, false),
            min_block_chars: config.grammar_min_block_chars,
            line_max_chars: config.line_max_block_chars,
            line_min_chars: config.line_min_block_chars,
        }
    }

    #[must_use]
    pub fn fallback(&self) -> &Arc<HybridFallbackChain> {
        &self.fallback
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    pub fn extract(
        &self,
        source: &str,
        file_path: &str,
        file_hash: &str,
        language: Language,
    ) -> ExtractionResult {
        let started = Instant::now();

        if source.trim().is_empty() {
            let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::Grammar);
            metadata.language =
                (language != Language::Unknown).then(|| language.as_str().to_string());
            metadata.processing_time_ms = elapsed_ms(started);
            return ExtractionResult::failure(ChunkerError::EmptyContent.to_string(), metadata);
        }

        let Some(profile) = self.executor.registry().profile(language) else {
            let reason = format!("no grammar profile for {}", language.as_str());
            return self.route_to_fallback(source, file_path, file_hash, language, reason, started);
        };

        if let Some(reason) = self.skip_reason(&profile, file_path, source.len()) {
            log::debug!("{file_path}: skipping grammar extraction ({reason})");
            return self.route_to_fallback(source, file_path, file_hash, language, reason, started);
        }

        let mut parser = Parser::new();
        let Some(results) =
            self.executor
                .run(source, &profile.query_source, &mut parser, language)
        else {
            let reason = "query execution produced no result".to_string();
            return self.route_to_fallback(source, file_path, file_hash, language, reason, started);
        };
        if results.values().all(Vec::is_empty) {
            let reason = "query matched nothing".to_string();
            return self.route_to_fallback(source, file_path, file_hash, language, reason, started);
        }

        let (blocks, dropped) = self.build_blocks(&results, &profile, source, file_path, file_hash);
        if blocks.is_empty() {
            let reason = "no grammar block survived filtering".to_string();
            return self.route_to_fallback(source, file_path, file_hash, language, reason, started);
        }

        let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::Grammar);
        metadata.language = Some(language.as_str().to_string());
        for (key, count) in [
            ("dropped_too_small", dropped.too_small),
            ("dropped_overlapping", dropped.overlapping),
            ("dropped_over_cap", dropped.over_cap),
            ("dropped_malformed", dropped.malformed),
            ("dropped_unmapped", dropped.unmapped),
        ] {
            if count > 0 {
                metadata = metadata.extra(key, count);
            }
        }
        metadata.processing_time_ms = elapsed_ms(started);
        ExtractionResult::success(blocks, metadata)
    }

    fn skip_reason(&self, profile: &LanguageProfile, file_path: &str, size: usize) -> Option<String> {
        if size as u64 > profile.max_file_size_bytes {
            return Some(format!(
                "file size {size} exceeds {} bytes",
                profile.max_file_size_bytes
            ));
        }
        let normalized = normalize_path(file_path);
        if self.skip_globs.is_match(&normalized) {
            return Some("path matches a skip pattern".to_string());
        }
        if profile.skip_test_files && is_test_file(&normalized) {
            return Some("test file".to_string());
        }
        if profile.skip_examples && is_example_file(&normalized) {
            return Some("example file".to_string());
        }
        None
    }

    fn build_blocks(
        &self,
        results: &QueryResults,
        profile: &LanguageProfile,
        source: &str,
        file_path: &str,
        file_hash: &str,
    ) -> (Vec<CodeBlock>, DropCounts) {
        let mut dropped = DropCounts::default();
        let mut candidates = Vec::new();

        for (group, occurrences) in results {
            let Some(block_type) = BlockType::from_capture_group(group) else {
                dropped.unmapped += occurrences.len();
                continue;
            };
            let name_key = format!("{group}.name");
            for occurrence in occurrences {
                let Some(main) = occurrence.get(group) else {
                    dropped.malformed += 1;
                    continue;
                };
                let start_line = occurrence
                    .values()
                    .map(|span| span.start_line)
                    .min()
                    .unwrap_or(main.start_line);
                let end_line = occurrence
                    .values()
                    .map(|span| span.last_content_line())
                    .max()
                    .unwrap_or(main.end_line);
                let identifier = occurrence
                    .get(&name_key)
                    .and_then(|name| source.get(name.start_byte..name.end_byte))
                    .map(|name| name.trim().to_string())
                    .unwrap_or_default();
                candidates.push(Candidate {
                    block_type,
                    start_line,
                    end_line,
                    identifier,
                });
            }
        }

        // Document order, enclosing nodes before the nodes they contain.
        candidates.sort_by(|a, b| {
            a.start_line
                .cmp(&b.start_line)
                .then(b.end_line.cmp(&a.end_line))
        });

        let index = LineIndex::new(source);
        let mut blocks: Vec<CodeBlock> = Vec::new();
        let mut per_type: HashMap<BlockType, usize> = HashMap::new();
        let mut covered_until = 0;

        for candidate in candidates {
            let Some(content) = index.slice(candidate.start_line, candidate.end_line) else {
                dropped.malformed += 1;
                continue;
            };
            if content.trim().chars().count() < self.min_block_chars {
                dropped.too_small += 1;
                continue;
            }
            if candidate.start_line <= covered_until {
                dropped.overlapping += 1;
                continue;
            }
            let taken = per_type.entry(candidate.block_type).or_default();
            if *taken >= profile.max_for(candidate.block_type) || blocks.len() >= profile.max_blocks
            {
                dropped.over_cap += 1;
                continue;
            }

            *taken += 1;
            covered_until = candidate.end_line;
            blocks.push(
                CodeBlock::new(
                    file_path,
                    candidate.block_type,
                    candidate.start_line,
                    candidate.end_line,
                    content,
                    file_hash,
                )
                .with_identifier(candidate.identifier),
            );
        }

        if dropped.over_cap > 0 {
            log::debug!(
                "{file_path}: {} grammar blocks dropped over the per-file caps",
                dropped.over_cap
            );
        }
        (blocks, dropped)
    }

    fn route_to_fallback(
        &self,
        source: &str,
        file_path: &str,
        file_hash: &str,
        language: Language,
        reason: String,
        started: Instant,
    ) -> ExtractionResult {
        let mut result = match self
            .fallback
            .try_parse_with_fallback(source, file_path, file_hash)
        {
            Ok(result) => result,
            Err((parser, e)) => {
                self.errors.report(
                    ErrorCategory::Parsing,
                    "extractor",
                    "fallback",
                    format!("{file_path}: parser {parser} failed: {e}"),
                );
                self.line_window_result(source, file_path, file_hash, parser, &e)
            }
        };

        if language != Language::Unknown {
            result.metadata.language = Some(language.as_str().to_string());
        }
        result.metadata.fallback_reason = Some(reason);
        result.metadata.processing_time_ms = elapsed_ms(started);
        result
    }

    /// Last resort when a selected fallback parser errors out.
    fn line_window_result(
        &self,
        source: &str,
        file_path: &str,
        file_hash: &str,
        parser: String,
        error: &ChunkerError,
    ) -> ExtractionResult {
        let index = LineIndex::new(source);
        let blocks = line_windows(source, self.line_max_chars, self.line_min_chars)
            .into_iter()
            .filter_map(|(start, end)| {
                let content = index.slice(start, end)?;
                Some(CodeBlock::new(
                    file_path,
                    BlockType::Chunk,
                    start,
                    end,
                    content,
                    file_hash,
                ))
            })
            .collect();

        let mut metadata = ExtractionMetadata::with_method(ExtractionMethod::LineWindow)
            .extra("fallback_error", error.to_string());
        metadata.fallback_parser_used = Some(parser);
        ExtractionResult::success(blocks, metadata)
    }
}

/// Test-file naming: `test_x`, `x_test`, `x.test`, `x.spec`, `tests`, ...
pub(crate) fn is_test_file(path: &str) -> bool {
    let Some(stem) = file_stem(path) else {
        return false;
    };
    TEST_MARKERS.iter().any(|marker| {
        stem == *marker
            || stem.starts_with(&format!("{marker}_"))
            || stem.ends_with(&format!("_{marker}"))
            || stem.contains(&format!("_{marker}_"))
            || stem.ends_with(&format!(".{marker}"))
    })
}

/// Example/sample/demo files, or anything under such a directory.
pub(crate) fn is_example_file(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    let mut components: Vec<&str> = lowered.split('/').filter(|c| !c.is_empty()).collect();
    components.pop();
    if components.iter().any(|dir| EXAMPLE_DIRS.contains(dir)) {
        return true;
    }

    let Some(stem) = file_stem(path) else {
        return false;
    };
    EXAMPLE_MARKERS.iter().any(|marker| {
        stem.starts_with(marker) || stem.ends_with(marker) || stem.contains(&format!("_{marker}"))
    })
}

fn file_stem(path: &str) -> Option<String> {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_ascii_lowercase)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::registry::GrammarRegistry;
    use crate::types::line_span;
    use pretty_assertions::assert_eq;

    fn extractor(config: &ChunkerConfig) -> BlockExtractor {
        let errors = Arc::new(ErrorReporter::new());
        let registry = Arc::new(GrammarRegistry::new(config, errors.clone()));
        let executor = Arc::new(QueryExecutor::new(registry, errors.clone()));
        let fallback = Arc::new(HybridFallbackChain::new(config));
        BlockExtractor::new(config, executor, fallback, errors)
    }

    fn rust_fn(name: &str) -> String {
        format!(
            "pub fn {name}(input: &str) -> usize {{\n    let trimmed = input.trim();\n    trimmed.len()\n}}\n"
        )
    }

    #[test]
    fn extracts_rust_items_with_exact_content() {
        let source = format!(
            "{}\npub struct Settings {{\n    pub name: String,\n    pub retries: u32,\n}}\n",
            rust_fn("measure")
        );
        let result = extractor(&ChunkerConfig::default()).extract(
            &source,
            "src/lib.rs",
            "h",
            Language::Rust,
        );

        assert!(result.success);
        assert_eq!(result.metadata.extraction_method, ExtractionMethod::Grammar);
        let summary: Vec<_> = result
            .blocks
            .iter()
            .map(|b| (b.block_type, b.identifier.as_str(), b.start_line, b.end_line))
            .collect();
        assert_eq!(
            summary,
            vec![
                (BlockType::Function, "measure", 1, 4),
                (BlockType::Class, "Settings", 6, 9),
            ]
        );
        for block in &result.blocks {
            assert_eq!(
                line_span(&source, block.start_line, block.end_line),
                Some(block.content.as_str())
            );
        }
    }

    #[test]
    fn impl_block_shadows_its_methods() {
        let source = "impl Counter {\n    pub fn bump(&mut self) -> u64 {\n        self.value += 1;\n        self.value\n    }\n}\n";
        let result = extractor(&ChunkerConfig::default()).extract(
            source,
            "src/counter.rs",
            "h",
            Language::Rust,
        );
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].block_type, BlockType::ImplBlock);
        assert_eq!(result.blocks[0].identifier, "Counter");
        assert_eq!(result.metadata.extra["dropped_overlapping"], 1);
    }

    #[test]
    fn per_type_cap_keeps_first_seen() {
        let mut config = ChunkerConfig::default();
        config.grammar_language_limits.clear();
        config.grammar_max_functions_per_file = 2;
        let source: String = ["alpha", "beta", "gamma", "delta"]
            .iter()
            .map(|name| rust_fn(name))
            .collect::<Vec<_>>()
            .join("\n");

        let result = extractor(&config).extract(&source, "src/lib.rs", "h", Language::Rust);
        let names: Vec<_> = result.blocks.iter().map(|b| b.identifier.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(result.metadata.extra["dropped_over_cap"], 2);
    }

    #[test]
    fn total_cap_applies_across_types() {
        let mut config = ChunkerConfig::default();
        config.grammar_language_limits.clear();
        config.grammar_max_blocks_per_file = 1;
        let source = format!("{}\n{}", rust_fn("first"), rust_fn("second"));

        let result = extractor(&config).extract(&source, "src/lib.rs", "h", Language::Rust);
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].identifier, "first");
    }

    #[test]
    fn unsupported_language_routes_to_fallback() {
        let result = extractor(&ChunkerConfig::default()).extract(
            "package main\n\nfunc main() {}\n",
            "main.go",
            "h",
            Language::Go,
        );
        assert!(result.success);
        assert_eq!(result.metadata.extraction_method, ExtractionMethod::Fallback);
        assert_eq!(
            result.metadata.fallback_reason.as_deref(),
            Some("no grammar profile for go")
        );
        assert_eq!(result.metadata.language.as_deref(), Some("go"));
    }

    #[test]
    fn skip_checks_route_to_fallback() {
        let extractor = extractor(&ChunkerConfig::default());
        let source = rust_fn("helper");
        for (path, reason) in [
            ("src/parser_test.rs", "test file"),
            ("examples/basic.rs", "example file"),
            ("target/debug/build/out.rs", "path matches a skip pattern"),
        ] {
            let result = extractor.extract(&source, path, "h", Language::Rust);
            assert_eq!(result.metadata.extraction_method, ExtractionMethod::Fallback);
            assert_eq!(result.metadata.fallback_reason.as_deref(), Some(reason), "{path}");
        }
    }

    #[test]
    fn oversized_file_skips_grammar() {
        let config = ChunkerConfig {
            grammar_max_file_size_bytes: 16,
            ..Default::default()
        };
        let result = extractor(&config).extract(&rust_fn("big"), "src/lib.rs", "h", Language::Rust);
        assert_ne!(result.metadata.extraction_method, ExtractionMethod::Grammar);
        assert!(result
            .metadata
            .fallback_reason
            .unwrap()
            .starts_with("file size"));
    }

    #[test]
    fn tiny_items_fall_through_to_fallback() {
        let result = extractor(&ChunkerConfig::default()).extract(
            "fn a() {}\n",
            "src/a.rs",
            "h",
            Language::Rust,
        );
        assert_eq!(result.metadata.extraction_method, ExtractionMethod::Fallback);
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].block_type, BlockType::TextChunk);
    }

    struct Exploding;

    impl crate::fallback::FallbackParser for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }
        fn description(&self) -> &str {
            "errors on every file"
        }
        fn patterns(&self) -> &[String] {
            &[]
        }
        fn can_parse(&self, _: &str, _: &str) -> bool {
            true
        }
        fn parse(&self, _: &str, _: &str, _: &str) -> Result<Vec<CodeBlock>> {
            Err(ChunkerError::parse("unexpected"))
        }
    }

    #[test]
    fn parser_error_uses_line_windows() {
        let config = ChunkerConfig::default();
        let errors = Arc::new(ErrorReporter::new());
        let registry = Arc::new(GrammarRegistry::new(&config, errors.clone()));
        let executor = Arc::new(QueryExecutor::new(registry, errors.clone()));
        let fallback = Arc::new(HybridFallbackChain::empty());
        fallback.register(Arc::new(Exploding));
        let extractor = BlockExtractor::new(&config, executor, fallback, errors.clone());

        let result = extractor.extract("some words\nmore words\n", "notes.bin", "h", Language::Unknown);
        assert!(result.success);
        assert_eq!(result.metadata.extraction_method, ExtractionMethod::LineWindow);
        assert_eq!(result.metadata.fallback_parser_used.as_deref(), Some("exploding"));
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(errors.count(ErrorCategory::Parsing), 1);
    }

    #[test]
    fn blank_source_is_empty_content() {
        let result = extractor(&ChunkerConfig::default()).extract(
            "\n   \n\t\n",
            "src/lib.rs",
            "h",
            Language::Rust,
        );
        assert!(!result.success);
        assert!(result.blocks.is_empty());
        assert_eq!(
            result.error_message.as_deref(),
            Some("Empty content provided")
        );
        assert_eq!(result.metadata.language.as_deref(), Some("rust"));
    }

    #[test]
    fn test_and_example_heuristics() {
        for path in [
            "a/test_utils.py",
            "a/utils_test.go",
            "a/button.test.tsx",
            "a/api.spec.ts",
            "tests.rs",
            "a/b_tests_c.py",
        ] {
            assert!(is_test_file(path), "{path}");
        }
        for path in ["src/contest.rs", "src/latest.py", "src/testing.rs"] {
            assert!(!is_test_file(path), "{path}");
        }

        assert!(is_example_file("examples/hello.rs"));
        assert!(is_example_file("src/demo_app.py"));
        assert!(is_example_file("src/basic_example.rs"));
        assert!(!is_example_file("src/parser.rs"));
    }
}
