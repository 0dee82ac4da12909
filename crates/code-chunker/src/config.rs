use std::collections::BTreeMap;

use globset::Glob;
use serde::{Deserialize, Serialize};

use crate::error::{ChunkerError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Configuration for the chunking engine.
///
/// Field names match the keys accepted by [`ChunkerConfig::from_toml_str`]; any key left
/// out of a TOML document keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Allow grammar-based extraction at all
    pub use_grammar_chunking: bool,

    /// Chunking strategy to use
    pub chunking_strategy: ChunkingStrategy,

    /// Languages allowed to use grammar extraction (empty = all linked grammars)
    pub grammar_languages: Vec<String>,

    /// Files larger than this skip grammar extraction
    pub grammar_max_file_size_bytes: u64,

    /// Grammar blocks shorter than this (trimmed chars) are dropped
    pub grammar_min_block_chars: usize,

    /// Hard cap on grammar blocks per file
    pub grammar_max_blocks_per_file: usize,

    pub grammar_max_functions_per_file: usize,
    pub grammar_max_classes_per_file: usize,
    pub grammar_max_impl_blocks_per_file: usize,

    /// Per-language overrides of the grammar caps above
    pub grammar_language_limits: BTreeMap<String, LanguageLimits>,

    /// Route test files to the fallback chain
    pub grammar_skip_test_files: bool,

    /// Route example/sample/demo files to the fallback chain
    pub grammar_skip_examples: bool,

    /// Globs of paths that never use grammar extraction
    pub grammar_skip_patterns: Vec<String>,

    /// Token window size for the token strategy
    pub token_chunk_size: usize,

    /// Tokens shared between consecutive token windows
    pub token_chunk_overlap: usize,

    /// Target window size (chars) for the line strategy
    pub line_max_block_chars: usize,

    /// Line windows with fewer trimmed chars are dropped
    pub line_min_block_chars: usize,

    /// Target chunk size (chars) for the plain-text fallback parser
    pub text_chunk_size: usize,

    /// Minimum lines per plain-text fallback chunk
    pub text_min_chunk_lines: usize,

    /// Fallback parser category -> globs it claims
    pub fallback_parser_patterns: BTreeMap<String, Vec<String>>,

    /// Allow memory-mapped reads
    pub use_mapped_file_reading: bool,

    /// Files smaller than this are always read through a buffer
    pub mapped_min_file_size_bytes: u64,

    /// `os/arch` pairs (e.g. `"windows/aarch64"`) where mapping is never attempted
    pub mapped_platform_denylist: Vec<String>,

    pub large_file_threshold_bytes: u64,
    pub streaming_threshold_bytes: u64,
    pub default_chunk_size_bytes: u64,
    pub max_chunk_size_bytes: u64,

    /// Per-language base chunk size for the scalable reader
    pub language_chunk_sizes: BTreeMap<String, u64>,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            use_grammar_chunking: true,
            chunking_strategy: ChunkingStrategy::Grammar,
            grammar_languages: Vec::new(),
            grammar_max_file_size_bytes: 512 * KIB,
            grammar_min_block_chars: 50,
            grammar_max_blocks_per_file: 100,
            grammar_max_functions_per_file: 50,
            grammar_max_classes_per_file: 20,
            grammar_max_impl_blocks_per_file: 30,
            grammar_language_limits: default_language_limits(),
            grammar_skip_test_files: true,
            grammar_skip_examples: true,
            grammar_skip_patterns: default_skip_patterns(),
            token_chunk_size: 1000,
            token_chunk_overlap: 200,
            line_max_block_chars: 1000,
            line_min_block_chars: 50,
            text_chunk_size: 1000,
            text_min_chunk_lines: 10,
            fallback_parser_patterns: default_fallback_patterns(),
            use_mapped_file_reading: false,
            mapped_min_file_size_bytes: 64 * KIB,
            mapped_platform_denylist: Vec::new(),
            large_file_threshold_bytes: 256 * KIB,
            streaming_threshold_bytes: MIB,
            default_chunk_size_bytes: 64 * KIB,
            max_chunk_size_bytes: 512 * KIB,
            language_chunk_sizes: default_language_chunk_sizes(),
        }
    }
}

impl ChunkerConfig {
    /// Grammar extraction with conservative budgets, for embedding pipelines
    pub fn for_grammar() -> Self {
        Self {
            chunking_strategy: ChunkingStrategy::Grammar,
            use_grammar_chunking: true,
            grammar_min_block_chars: 20,
            ..Default::default()
        }
    }

    /// Plain line windows, no parsing
    pub fn for_speed() -> Self {
        Self {
            chunking_strategy: ChunkingStrategy::Lines,
            use_grammar_chunking: false,
            ..Default::default()
        }
    }

    /// Memory-mapped reads and earlier streaming for repositories with huge files
    pub fn for_large_files() -> Self {
        Self {
            use_mapped_file_reading: true,
            large_file_threshold_bytes: 128 * KIB,
            streaming_threshold_bytes: 512 * KIB,
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| ChunkerError::invalid_config(format!("failed to parse TOML: {e}")))?;
        config.validate().map_err(ChunkerError::invalid_config)?;
        Ok(config)
    }

    /// Strategy actually used by the façade.
    ///
    /// `grammar` degrades to `lines` when grammar chunking is switched off.
    #[must_use]
    pub const fn effective_strategy(&self) -> ChunkingStrategy {
        match self.chunking_strategy {
            ChunkingStrategy::Grammar if !self.use_grammar_chunking => ChunkingStrategy::Lines,
            other => other,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.token_chunk_size == 0 {
            return Err("token_chunk_size must be > 0".to_string());
        }

        if self.token_chunk_overlap >= self.token_chunk_size {
            return Err(format!(
                "token_chunk_overlap ({}) must be smaller than token_chunk_size ({})",
                self.token_chunk_overlap, self.token_chunk_size
            ));
        }

        if self.line_max_block_chars == 0 {
            return Err("line_max_block_chars must be > 0".to_string());
        }

        if self.large_file_threshold_bytes > self.streaming_threshold_bytes {
            return Err(format!(
                "large_file_threshold_bytes ({}) cannot exceed streaming_threshold_bytes ({})",
                self.large_file_threshold_bytes, self.streaming_threshold_bytes
            ));
        }

        if self.default_chunk_size_bytes == 0 {
            return Err("default_chunk_size_bytes must be > 0".to_string());
        }

        if self.default_chunk_size_bytes > self.max_chunk_size_bytes {
            return Err(format!(
                "default_chunk_size_bytes ({}) cannot exceed max_chunk_size_bytes ({})",
                self.default_chunk_size_bytes, self.max_chunk_size_bytes
            ));
        }

        let fallback_globs = self.fallback_parser_patterns.values().flatten();
        for pattern in self.grammar_skip_patterns.iter().chain(fallback_globs) {
            Glob::new(pattern).map_err(|e| format!("invalid glob pattern '{pattern}': {e}"))?;
        }

        Ok(())
    }
}

/// Caps that replace the global grammar caps for one language
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageLimits {
    pub max_blocks: Option<usize>,
    pub max_functions: Option<usize>,
    pub max_classes: Option<usize>,
    pub max_impl_blocks: Option<usize>,
}

/// Strategy for chunking code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Fixed line windows; always available
    Lines,

    /// Approximate-token windows with overlap
    Tokens,

    /// Grammar-based extraction with fallbacks
    Grammar,
}

impl ChunkingStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lines => "lines",
            Self::Tokens => "tokens",
            Self::Grammar => "grammar",
        }
    }
}

fn default_skip_patterns() -> Vec<String> {
    [
        "*.min.js",
        "*.bundle.js",
        "*.min.css",
        "**/package-lock.json",
        "**/yarn.lock",
        "*.lock",
        "**/target/**",
        "**/build/**",
        "**/dist/**",
        "**/__pycache__/**",
        "**/node_modules/**",
        "*.log",
        "*.tmp",
        "*.temp",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_language_limits() -> BTreeMap<String, LanguageLimits> {
    let rust = LanguageLimits {
        max_blocks: Some(30),
        max_functions: Some(40),
        max_impl_blocks: Some(25),
        ..Default::default()
    };
    let scripting = LanguageLimits {
        max_functions: Some(60),
        ..Default::default()
    };
    BTreeMap::from([
        ("rust".to_string(), rust),
        ("javascript".to_string(), scripting),
        ("typescript".to_string(), scripting),
        ("tsx".to_string(), scripting),
    ])
}

fn default_fallback_patterns() -> BTreeMap<String, Vec<String>> {
    let entries: [(&str, &[&str]); 4] = [
        ("config", &["*.ini", "*.cfg", "*.conf", "*.properties", "*.env"]),
        ("text", &["*.txt", "*.log", "*.out", "*.err"]),
        ("documentation", &["*.md", "*.rst"]),
        ("data", &["*.csv", "*.tsv", "*.json", "*.xml", "*.yaml", "*.yml"]),
    ];
    entries
        .into_iter()
        .map(|(category, globs)| {
            (
                category.to_string(),
                globs.iter().map(|g| (*g).to_string()).collect(),
            )
        })
        .collect()
}

fn default_language_chunk_sizes() -> BTreeMap<String, u64> {
    [
        ("python", 64 * KIB),
        ("javascript", 128 * KIB),
        ("typescript", 128 * KIB),
        ("java", 256 * KIB),
        ("cpp", 256 * KIB),
        ("rust", 128 * KIB),
        ("go", 128 * KIB),
        ("text", 32 * KIB),
        ("markdown", 32 * KIB),
        ("json", 64 * KIB),
        ("xml", 128 * KIB),
        ("yaml", 32 * KIB),
    ]
    .into_iter()
    .map(|(lang, size)| (lang.to_string(), size))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = ChunkerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_preset_configs_valid() {
        assert!(ChunkerConfig::for_grammar().validate().is_ok());
        assert!(ChunkerConfig::for_speed().validate().is_ok());
        assert!(ChunkerConfig::for_large_files().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ChunkerConfig::default();

        // Invalid: overlap >= window
        config.token_chunk_overlap = config.token_chunk_size;
        assert!(config.validate().is_err());
        config.token_chunk_overlap = 10;

        // Invalid: large threshold above streaming threshold
        config.large_file_threshold_bytes = 2 * MIB;
        assert!(config.validate().is_err());
        config.large_file_threshold_bytes = 256 * KIB;

        // Invalid: default chunk above max chunk
        config.default_chunk_size_bytes = config.max_chunk_size_bytes + 1;
        assert!(config.validate().is_err());
        config.default_chunk_size_bytes = 64 * KIB;

        // Invalid: bad glob
        config.grammar_skip_patterns.push("[unclosed".to_string());
        assert!(config.validate().is_err());
        config.grammar_skip_patterns.pop();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_strategy() {
        let mut config = ChunkerConfig::default();
        assert_eq!(config.effective_strategy(), ChunkingStrategy::Grammar);

        config.use_grammar_chunking = false;
        assert_eq!(config.effective_strategy(), ChunkingStrategy::Lines);

        config.chunking_strategy = ChunkingStrategy::Tokens;
        assert_eq!(config.effective_strategy(), ChunkingStrategy::Tokens);
    }

    #[test]
    fn test_from_toml_str() {
        let config = ChunkerConfig::from_toml_str(
            r#"
chunking_strategy = "tokens"
token_chunk_size = 300
token_chunk_overlap = 30
grammar_skip_patterns = ["*.gen.rs"]

[language_chunk_sizes]
python = 1024
"#,
        )
        .unwrap();

        assert_eq!(config.chunking_strategy, ChunkingStrategy::Tokens);
        assert_eq!(config.token_chunk_size, 300);
        assert_eq!(config.grammar_skip_patterns, vec!["*.gen.rs".to_string()]);
        assert_eq!(config.language_chunk_sizes["python"], 1024);
        // Untouched keys keep defaults
        assert_eq!(config.grammar_max_blocks_per_file, 100);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let result = ChunkerConfig::from_toml_str("token_chunk_size = 10\ntoken_chunk_overlap = 10\n");
        assert!(matches!(result, Err(ChunkerError::InvalidConfig(_))));
    }

    #[test]
    fn test_language_limits_from_toml() {
        let config = ChunkerConfig::from_toml_str(
            r#"
[grammar_language_limits.python]
max_functions = 5
"#,
        )
        .unwrap();

        let python = config.grammar_language_limits["python"];
        assert_eq!(python.max_functions, Some(5));
        assert_eq!(python.max_classes, None);
        // Replacing the table drops the built-in entries
        assert!(!config.grammar_language_limits.contains_key("rust"));
        assert_eq!(
            ChunkerConfig::default().grammar_language_limits["rust"].max_functions,
            Some(40)
        );
    }

    #[test]
    fn test_default_chunk_sizes_per_language() {
        let config = ChunkerConfig::default();
        assert_eq!(config.default_chunk_size_bytes, 64 * KIB);
        assert_eq!(config.language_chunk_sizes["java"], 256 * KIB);
        assert_eq!(config.language_chunk_sizes["markdown"], 32 * KIB);
        assert!(!config.language_chunk_sizes.contains_key("cobol"));
    }
}
