//! Grammar registry: per-language profiles and the compiled-query cache.
//!
//! Compilation never branches on a binding version. The [`QueryBinding`] is asked for
//! each execution tier in turn and the compiled query keeps every tier it offered; a
//! binding that offers none yields no compiled query, which callers treat as "no
//! grammar support".

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use tree_sitter::Query;

use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, ErrorCategory, ErrorReporter, Result};
use crate::executor::{
    CapturesRunner, CursorWalkRunner, ExecutionTier, MatchesRunner, QueryRunner,
    DEFAULT_MATCH_LIMIT,
};
use crate::language::Language;
use crate::queries::{self, GrammarDefinition};
use crate::types::{file_hash, BlockType};

/// Per-language extraction settings. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub language: Language,
    pub extensions: BTreeSet<String>,
    pub query_source: String,
    /// Node kind -> capture group, for tiers that walk the tree directly
    pub node_types: BTreeMap<String, String>,
    pub max_file_size_bytes: u64,
    pub max_blocks: usize,
    pub max_functions: usize,
    pub max_classes: usize,
    pub max_impl_blocks: usize,
    pub skip_test_files: bool,
    pub skip_examples: bool,
}

impl LanguageProfile {
    /// Build a profile from a grammar definition, applying the configured caps and
    /// any per-language overrides.
    #[must_use]
    pub fn from_definition(definition: &GrammarDefinition, config: &ChunkerConfig) -> Self {
        let limits = config
            .grammar_language_limits
            .get(definition.language.as_str())
            .copied()
            .unwrap_or_default();

        Self {
            language: definition.language,
            extensions: definition.extensions.iter().map(|e| (*e).to_string()).collect(),
            query_source: definition.query.to_string(),
            node_types: definition
                .node_groups
                .iter()
                .map(|(kind, group)| ((*kind).to_string(), (*group).to_string()))
                .collect(),
            max_file_size_bytes: config.grammar_max_file_size_bytes,
            max_blocks: limits.max_blocks.unwrap_or(config.grammar_max_blocks_per_file),
            max_functions: limits
                .max_functions
                .unwrap_or(config.grammar_max_functions_per_file),
            max_classes: limits.max_classes.unwrap_or(config.grammar_max_classes_per_file),
            max_impl_blocks: limits
                .max_impl_blocks
                .unwrap_or(config.grammar_max_impl_blocks_per_file),
            skip_test_files: config.grammar_skip_test_files,
            skip_examples: config.grammar_skip_examples,
        }
    }

    /// Cap for one block type; non-structural types are bounded by `max_blocks` only.
    #[must_use]
    pub const fn max_for(&self, block_type: BlockType) -> usize {
        match block_type {
            BlockType::Function => self.max_functions,
            BlockType::Class => self.max_classes,
            BlockType::ImplBlock => self.max_impl_blocks,
            _ => self.max_blocks,
        }
    }
}

/// A query bound to one `(language, query_source)` pair, with the execution tiers the
/// binding offered for it. Shared freely across threads.
pub struct CompiledQuery {
    language: Language,
    query_source: String,
    query: Query,
    node_groups: BTreeMap<String, String>,
    runners: Vec<Arc<dyn QueryRunner>>,
}

impl CompiledQuery {
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    #[must_use]
    pub fn query_source(&self) -> &str {
        &self.query_source
    }

    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// Capture group for a node kind, used by the tree-cursor tier
    #[must_use]
    pub fn group_for_node(&self, kind: &str) -> Option<&str> {
        self.node_groups.get(kind).map(String::as_str)
    }

    /// Available execution tiers, in the order they are tried
    #[must_use]
    pub fn tiers(&self) -> Vec<ExecutionTier> {
        self.runners.iter().map(|runner| runner.tier()).collect()
    }

    pub(crate) fn runners(&self) -> &[Arc<dyn QueryRunner>] {
        &self.runners
    }
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery")
            .field("language", &self.language)
            .field("patterns", &self.query.pattern_count())
            .field("tiers", &self.tiers())
            .finish()
    }
}

/// What the installed parser binding can do with a query.
///
/// Each method answers one capability probe; `None`/`Err` means the tier is missing.
pub trait QueryBinding: Send + Sync {
    /// Primary query constructor
    fn construct(&self, language: &tree_sitter::Language, source: &str) -> Result<Query>;

    /// Capture-stream execution, if the binding exposes it
    fn captures(&self) -> Option<Arc<dyn QueryRunner>>;

    /// Per-match execution, if the binding exposes it
    fn matches(&self) -> Option<Arc<dyn QueryRunner>>;

    /// Separate cursor-driven executor
    fn cursor(&self) -> Result<Arc<dyn QueryRunner>>;
}

/// The linked `tree-sitter` crate, which offers every tier
#[derive(Debug, Clone, Copy)]
pub struct NativeBinding {
    match_limit: u32,
}

impl NativeBinding {
    #[must_use]
    pub const fn new(match_limit: u32) -> Self {
        Self { match_limit }
    }
}

impl Default for NativeBinding {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_LIMIT)
    }
}

impl QueryBinding for NativeBinding {
    fn construct(&self, language: &tree_sitter::Language, source: &str) -> Result<Query> {
        Query::new(language, source).map_err(|e| ChunkerError::query(e.to_string()))
    }

    fn captures(&self) -> Option<Arc<dyn QueryRunner>> {
        Some(Arc::new(CapturesRunner::new(self.match_limit)))
    }

    fn matches(&self) -> Option<Arc<dyn QueryRunner>> {
        Some(Arc::new(MatchesRunner::new(self.match_limit)))
    }

    fn cursor(&self) -> Result<Arc<dyn QueryRunner>> {
        Ok(Arc::new(CursorWalkRunner))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    language: Language,
    query_source: String,
}

pub struct GrammarRegistry {
    profiles: RwLock<HashMap<Language, Arc<LanguageProfile>>>,
    compiled: RwLock<HashMap<QueryKey, Arc<CompiledQuery>>>,
    binding: Arc<dyn QueryBinding>,
    errors: Arc<ErrorReporter>,
}

impl fmt::Debug for GrammarRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrammarRegistry")
            .field("languages", &self.languages())
            .field("compiled_queries", &self.compiled_count())
            .finish_non_exhaustive()
    }
}

impl GrammarRegistry {
    pub fn new(config: &ChunkerConfig, errors: Arc<ErrorReporter>) -> Self {
        Self::with_binding(config, errors, Arc::new(NativeBinding::default()))
    }

    /// Registry using a specific binding. Languages not listed in
    /// `grammar_languages` (when that list is non-empty) get no profile.
    pub fn with_binding(
        config: &ChunkerConfig,
        errors: Arc<ErrorReporter>,
        binding: Arc<dyn QueryBinding>,
    ) -> Self {
        let allowed: HashSet<Language> = config
            .grammar_languages
            .iter()
            .map(|name| Language::from_name(name))
            .collect();

        let profiles = queries::GRAMMARS
            .iter()
            .filter(|grammar| allowed.is_empty() || allowed.contains(&grammar.language))
            .map(|grammar| {
                (
                    grammar.language,
                    Arc::new(LanguageProfile::from_definition(grammar, config)),
                )
            })
            .collect();

        Self {
            profiles: RwLock::new(profiles),
            compiled: RwLock::new(HashMap::new()),
            binding,
            errors,
        }
    }

    /// Languages with a profile, sorted by key
    #[must_use]
    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self
            .profiles
            .read()
            .map(|profiles| profiles.keys().copied().collect())
            .unwrap_or_default();
        languages.sort_by_key(|lang| lang.as_str());
        languages
    }

    #[must_use]
    pub fn profile(&self, language: Language) -> Option<Arc<LanguageProfile>> {
        self.profiles.read().ok()?.get(&language).cloned()
    }

    #[must_use]
    pub fn profile_for(&self, language: &str) -> Option<Arc<LanguageProfile>> {
        self.profile(resolve(language)?)
    }

    #[must_use]
    pub fn query_for(&self, language: &str) -> Option<String> {
        self.profile_for(language)
            .map(|profile| profile.query_source.clone())
    }

    #[must_use]
    pub fn node_types_for(&self, language: &str) -> Option<BTreeSet<String>> {
        self.profile_for(language)
            .map(|profile| profile.node_types.keys().cloned().collect())
    }

    /// Language key for an extension (case-insensitive, leading dot optional)
    #[must_use]
    pub fn language_for_extension(&self, ext: &str) -> Option<&'static str> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        if ext.is_empty() {
            return None;
        }
        let profiles = self.profiles.read().ok()?;
        let mut matches: Vec<Language> = profiles
            .values()
            .filter(|profile| profile.extensions.contains(&ext))
            .map(|profile| profile.language)
            .collect();
        matches.sort_by_key(|lang| lang.as_str());
        matches.first().map(|lang| lang.as_str())
    }

    /// Compile `query_source` for `language`, or return the cached compilation.
    pub fn compile(&self, language: &str, query_source: &str) -> Option<Arc<CompiledQuery>> {
        self.compile_for(resolve(language)?, query_source)
    }

    pub fn compile_for(
        &self,
        language: Language,
        query_source: &str,
    ) -> Option<Arc<CompiledQuery>> {
        let profile = self.profile(language)?;
        if query_source.trim().is_empty() {
            return None;
        }

        let key = QueryKey {
            language,
            query_source: query_source.to_string(),
        };
        if let Ok(compiled) = self.compiled.read() {
            if let Some(hit) = compiled.get(&key) {
                return Some(hit.clone());
            }
        }

        let report_key = format!(
            "compile:{}:{}",
            language.as_str(),
            query_fingerprint(query_source)
        );
        let query = match language
            .tree_sitter_language()
            .and_then(|ts_language| self.binding.construct(&ts_language, query_source))
        {
            Ok(query) => query,
            Err(e) => {
                self.errors.report_once(
                    &report_key,
                    ErrorCategory::Query,
                    "registry",
                    "compile",
                    format!("{}: {e}", language.as_str()),
                );
                return None;
            }
        };

        let mut runners = Vec::with_capacity(3);
        runners.extend(self.binding.captures());
        runners.extend(self.binding.matches());
        match self.binding.cursor() {
            Ok(runner) => runners.push(runner),
            Err(e) => log::debug!("No cursor executor for {}: {e}", language.as_str()),
        }

        if runners.is_empty() {
            self.errors.report_once(
                &report_key,
                ErrorCategory::Query,
                "registry",
                "compile",
                format!(
                    "{}: binding exposes no captures, matches or cursor execution",
                    language.as_str()
                ),
            );
            return None;
        }

        let compiled = Arc::new(CompiledQuery {
            language,
            query_source: query_source.to_string(),
            query,
            node_groups: profile.node_types.clone(),
            runners,
        });

        match self.compiled.write() {
            Ok(mut cache) => Some(cache.entry(key).or_insert(compiled).clone()),
            Err(_) => {
                log::warn!("Compiled-query cache lock poisoned, returning uncached query");
                Some(compiled)
            }
        }
    }

    /// Tiers available for the language's built-in query
    #[must_use]
    pub fn api_surface(&self, language: &str) -> Option<Vec<ExecutionTier>> {
        let language = resolve(language)?;
        let source = self.profile(language)?.query_source.clone();
        self.compile_for(language, &source)
            .map(|compiled| compiled.tiers())
    }

    /// Drop every compiled query of one language.
    pub fn invalidate(&self, language: Language) {
        if let Ok(mut compiled) = self.compiled.write() {
            compiled.retain(|key, _| key.language != language);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut compiled) = self.compiled.write() {
            compiled.clear();
        }
    }

    /// Replace a language's profile and drop its compiled queries.
    pub fn override_profile(&self, language: &str, mut profile: LanguageProfile) -> Result<()> {
        let language = resolve(language)
            .filter(|lang| lang.supports_grammar())
            .ok_or_else(|| ChunkerError::unsupported_language(language))?;
        profile.language = language;

        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| ChunkerError::Other("profile table lock poisoned".to_string()))?;
        profiles.insert(language, Arc::new(profile));
        drop(profiles);

        self.invalidate(language);
        log::debug!("Profile for {} overridden", language.as_str());
        Ok(())
    }

    #[must_use]
    pub fn compiled_count(&self) -> usize {
        self.compiled.read().map(|compiled| compiled.len()).unwrap_or(0)
    }
}

fn resolve(language: &str) -> Option<Language> {
    match Language::from_name(language) {
        Language::Unknown => None,
        lang => Some(lang),
    }
}

/// Short stable key for a query source in error reports
pub(crate) fn query_fingerprint(query_source: &str) -> String {
    file_hash(query_source)[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> (GrammarRegistry, Arc<ErrorReporter>) {
        let errors = Arc::new(ErrorReporter::new());
        (GrammarRegistry::new(&ChunkerConfig::default(), errors.clone()), errors)
    }

    /// Constructs queries but exposes no way to run them
    struct InertBinding;

    impl QueryBinding for InertBinding {
        fn construct(&self, language: &tree_sitter::Language, source: &str) -> Result<Query> {
            NativeBinding::default().construct(language, source)
        }

        fn captures(&self) -> Option<Arc<dyn QueryRunner>> {
            None
        }

        fn matches(&self) -> Option<Arc<dyn QueryRunner>> {
            None
        }

        fn cursor(&self) -> Result<Arc<dyn QueryRunner>> {
            Err(ChunkerError::query("cursor construction failed"))
        }
    }

    #[test]
    fn accessors_tolerate_unknown_languages() {
        let (registry, _) = registry();
        assert!(registry.query_for("cobol").is_none());
        assert!(registry.profile_for("").is_none());
        assert!(registry.node_types_for("go").is_none());
        assert!(registry.compile("", "(identifier) @x").is_none());
        assert!(registry.language_for_extension("").is_none());
        assert!(registry.language_for_extension(".zzz").is_none());
    }

    #[test]
    fn accessors_for_known_languages() {
        let (registry, _) = registry();
        assert_eq!(registry.language_for_extension(".RS"), Some("rust"));
        assert_eq!(registry.language_for_extension("py"), Some("python"));
        assert_eq!(registry.language_for_extension("tsx"), Some("tsx"));

        let node_types = registry.node_types_for("Python").unwrap();
        assert!(node_types.contains("function_definition"));
        assert!(registry.query_for("rust").unwrap().contains("impl_item"));
    }

    #[test]
    fn profiles_apply_language_limits() {
        let (registry, _) = registry();
        let rust = registry.profile(Language::Rust).unwrap();
        assert_eq!(rust.max_functions, 40);
        assert_eq!(rust.max_impl_blocks, 25);
        assert_eq!(rust.max_blocks, 30);
        assert_eq!(rust.max_classes, 20);

        let python = registry.profile(Language::Python).unwrap();
        assert_eq!(python.max_functions, 50);
        assert_eq!(python.max_for(BlockType::Class), 20);

        let js = registry.profile(Language::JavaScript).unwrap();
        assert_eq!(js.max_functions, 60);
    }

    #[test]
    fn grammar_languages_restricts_profiles() {
        let config = ChunkerConfig {
            grammar_languages: vec!["python".to_string()],
            ..Default::default()
        };
        let registry = GrammarRegistry::new(&config, Arc::new(ErrorReporter::new()));
        assert_eq!(registry.languages(), vec![Language::Python]);
        assert!(registry.profile_for("rust").is_none());
    }

    #[test]
    fn compile_is_cached_per_language() {
        let (registry, _) = registry();
        let query = "(identifier) @function";

        let rust_a = registry.compile("rust", query).unwrap();
        let rust_b = registry.compile("rust", query).unwrap();
        let python = registry.compile("python", query).unwrap();

        assert!(Arc::ptr_eq(&rust_a, &rust_b));
        assert!(!Arc::ptr_eq(&rust_a, &python));
        assert_eq!(rust_a.language(), Language::Rust);
        assert_eq!(python.language(), Language::Python);
        assert_eq!(registry.compiled_count(), 2);

        registry.invalidate(Language::Rust);
        assert_eq!(registry.compiled_count(), 1);
        let rust_c = registry.compile("rust", query).unwrap();
        assert!(!Arc::ptr_eq(&rust_a, &rust_c));

        registry.invalidate_all();
        assert_eq!(registry.compiled_count(), 0);
    }

    #[test]
    fn invalid_query_reports_once() {
        let (registry, errors) = registry();
        assert!(registry.compile("rust", "(not_a_real_node) @x").is_none());
        assert!(registry.compile("rust", "(not_a_real_node) @x").is_none());
        assert_eq!(errors.count(ErrorCategory::Query), 1);
    }

    #[test]
    fn binding_without_execution_api_yields_none_once() {
        let errors = Arc::new(ErrorReporter::new());
        let registry = GrammarRegistry::with_binding(
            &ChunkerConfig::default(),
            errors.clone(),
            Arc::new(InertBinding),
        );

        let query = registry.query_for("python").unwrap();
        assert!(registry.compile("python", &query).is_none());
        assert!(registry.compile("python", &query).is_none());
        assert!(registry.api_surface("python").is_none());

        assert_eq!(errors.count(ErrorCategory::Query), 1);
        assert_eq!(registry.compiled_count(), 0);
    }

    #[test]
    fn native_api_surface_has_every_tier() {
        let (registry, _) = registry();
        assert_eq!(
            registry.api_surface("rust"),
            Some(vec![
                ExecutionTier::Captures,
                ExecutionTier::Matches,
                ExecutionTier::Cursor
            ])
        );
        assert_eq!(registry.api_surface("go"), None);
    }

    #[test]
    fn override_profile_replaces_and_invalidates() {
        let (registry, _) = registry();
        let original = registry.query_for("python").unwrap();
        registry.compile("python", &original).unwrap();

        let mut profile = (*registry.profile(Language::Python).unwrap()).clone();
        profile.query_source = "(class_definition) @class".to_string();
        profile.max_classes = 3;
        registry.override_profile("python", profile).unwrap();

        assert_eq!(registry.query_for("python").unwrap(), "(class_definition) @class");
        assert_eq!(registry.profile(Language::Python).unwrap().max_classes, 3);
        assert_eq!(registry.compiled_count(), 0);

        let unknown = registry.override_profile(
            "cobol",
            (*registry.profile(Language::Python).unwrap()).clone(),
        );
        assert!(matches!(unknown, Err(ChunkerError::UnsupportedLanguage(_))));
    }
}
