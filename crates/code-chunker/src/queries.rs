//! Built-in grammar definitions: extensions, query source and node-type table for
//! every language with a linked grammar.
//!
//! Each pattern tags the whole node `@<group>` and, where the grammar has one, its
//! name `@<group>.name`. The group decides the block type (see
//! [`crate::BlockType::from_capture_group`]).

use crate::language::Language;

/// Static description of one grammar
#[derive(Debug, Clone, Copy)]
pub struct GrammarDefinition {
    pub language: Language,
    pub extensions: &'static [&'static str],
    pub query: &'static str,
    /// `(node kind, capture group)` pairs, used by the tree-cursor tier
    pub node_groups: &'static [(&'static str, &'static str)],
}

const RUST_QUERY: &str = r#"
(function_item name: (identifier) @function.name) @function
(struct_item name: (type_identifier) @struct.name) @struct
(enum_item name: (type_identifier) @enum.name) @enum
(trait_item name: (type_identifier) @trait.name) @trait
(impl_item type: (_) @impl.name) @impl
"#;

const PYTHON_QUERY: &str = r#"
(function_definition name: (identifier) @function.name) @function
(class_definition name: (identifier) @class.name) @class
"#;

const JAVASCRIPT_QUERY: &str = r#"
(function_declaration name: (identifier) @function.name) @function
(generator_function_declaration name: (identifier) @function.name) @function
(class_declaration name: (identifier) @class.name) @class
(method_definition name: (property_identifier) @method.name) @method
(lexical_declaration
  (variable_declarator
    name: (identifier) @function.name
    value: (arrow_function))) @function
"#;

const TYPESCRIPT_QUERY: &str = r#"
(function_declaration name: (identifier) @function.name) @function
(generator_function_declaration name: (identifier) @function.name) @function
(class_declaration name: (type_identifier) @class.name) @class
(abstract_class_declaration name: (type_identifier) @class.name) @class
(interface_declaration name: (type_identifier) @interface.name) @interface
(type_alias_declaration name: (type_identifier) @type.name) @type
(enum_declaration name: (identifier) @enum.name) @enum
(method_definition name: (property_identifier) @method.name) @method
(lexical_declaration
  (variable_declarator
    name: (identifier) @function.name
    value: (arrow_function))) @function
"#;

const RUST_NODES: &[(&str, &str)] = &[
    ("function_item", "function"),
    ("struct_item", "struct"),
    ("enum_item", "enum"),
    ("trait_item", "trait"),
    ("impl_item", "impl"),
];

const PYTHON_NODES: &[(&str, &str)] = &[
    ("function_definition", "function"),
    ("class_definition", "class"),
];

const JAVASCRIPT_NODES: &[(&str, &str)] = &[
    ("function_declaration", "function"),
    ("generator_function_declaration", "function"),
    ("class_declaration", "class"),
    ("method_definition", "method"),
];

const TYPESCRIPT_NODES: &[(&str, &str)] = &[
    ("function_declaration", "function"),
    ("generator_function_declaration", "function"),
    ("class_declaration", "class"),
    ("abstract_class_declaration", "class"),
    ("interface_declaration", "interface"),
    ("type_alias_declaration", "type"),
    ("enum_declaration", "enum"),
    ("method_definition", "method"),
];

pub const GRAMMARS: [GrammarDefinition; 5] = [
    GrammarDefinition {
        language: Language::Rust,
        extensions: &["rs"],
        query: RUST_QUERY,
        node_groups: RUST_NODES,
    },
    GrammarDefinition {
        language: Language::Python,
        extensions: &["py", "pyw", "pyi"],
        query: PYTHON_QUERY,
        node_groups: PYTHON_NODES,
    },
    GrammarDefinition {
        language: Language::JavaScript,
        extensions: &["js", "mjs", "cjs", "jsx"],
        query: JAVASCRIPT_QUERY,
        node_groups: JAVASCRIPT_NODES,
    },
    GrammarDefinition {
        language: Language::TypeScript,
        extensions: &["ts", "mts", "cts"],
        query: TYPESCRIPT_QUERY,
        node_groups: TYPESCRIPT_NODES,
    },
    GrammarDefinition {
        language: Language::Tsx,
        extensions: &["tsx"],
        query: TYPESCRIPT_QUERY,
        node_groups: TYPESCRIPT_NODES,
    },
];
