//! Schema Compiler (§4.1): turns a YAML resource-schema document into a
//! [`SchemaRegistry`] of compiled field shapes, grounded in the three-pass
//! dynamic-model generation in `resources/dynamic_models.py` — data models
//! first, then resources, then collections — but keeping field types as
//! name-addressed entries in one flat map instead of nested Rust structs, so
//! forward references (a resource declared before the data model it embeds)
//! resolve without any ordering requirement.
//!
//! Unknown primitive keywords fall back to `FieldType::String`; unknown
//! schema references fall back to `FieldType::Any`. Both are logged via
//! `log::warn!` rather than rejected, per §4.1's tolerance for partially
//! well-formed schema documents.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

/// Namespace prefix for fully-qualified schema names (see
/// [`SchemaRegistry::fully_qualified_name`]).
pub const NAMESPACE: &str = "con_mon_v2.mappings";

/// The aggregate functions a generated field path may be wrapped in.
pub const AGGREGATE_FUNCTIONS: [&str; 6] = ["any", "all", "count", "sum", "max", "min"];

// ---------------------------------------------------------------------------
// Compiled types
// ---------------------------------------------------------------------------

/// A field's resolved type within a compiled schema.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Float,
    Datetime,
    /// An untyped JSON blob — used for bare `object`/`array` declarations
    /// and as the fallback for an unresolved schema reference.
    Any,
    Array(Box<FieldType>),
    /// A reference to another entry in the same [`SchemaRegistry`], by name.
    Object(String),
}

/// One declared field on a [`CompiledSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

/// What role a compiled schema plays in the registry, mirroring the three
/// passes of the original model generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// A nested data shape (declared name ends in `Data`, or a name
    /// synthesised for an inline nested object/array-of-object field).
    Data,
    /// A top-level fetchable resource.
    Resource,
    /// A collection of resources of one type (`collection_type` set).
    Collection,
}

/// One compiled schema: a resource, a nested data shape, or a collection.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub name: String,
    pub kind: SchemaKind,
    pub provider: String,
    pub description: String,
    /// For `Collection` schemas, the name of the resource type its
    /// `resources` field holds — `None` if that reference never resolved
    /// (the schema then behaves as a plain resource, per the original
    /// generator's fallback).
    pub collection_type: Option<String>,
    pub fields: Vec<FieldDef>,
}

/// All schemas compiled from one YAML document, keyed by schema name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    pub schemas: HashMap<String, CompiledSchema>,
}

impl SchemaRegistry {
    /// The stable, string-compared type name a [`crate::resource::Resource`]
    /// carries and a Check's `metadata.resource_type` binds to.
    #[must_use]
    pub fn fully_qualified_name(provider: &str, schema_name: &str) -> String {
        format!("{NAMESPACE}.{provider}.{schema_name}")
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CompiledSchema> {
        self.schemas.get(name)
    }

    /// Generate candidate field paths for a compiled schema, bounded by
    /// `max_depth` levels of nesting, including `len(...)` wrapped variants
    /// for every path and `any/all/count/sum/max/min(...)` wrapped variants
    /// for every array-valued path. Used to populate generator prompts with
    /// real, parseable field paths (§4.6) — every path returned here parses
    /// successfully in `crate::field_path`.
    #[must_use]
    pub fn field_paths(&self, schema_name: &str, max_depth: usize) -> Vec<String> {
        let mut base_paths = std::collections::BTreeSet::new();
        // Every compiled record carries the Resource abstract record's base
        // fields (§4.1) alongside its own declared fields.
        base_paths.insert("id".to_owned());
        base_paths.insert("source_connector".to_owned());
        if let Some(schema) = self.schemas.get(schema_name) {
            self.walk_fields(schema, String::new(), 0, max_depth, &mut base_paths);
        }

        let mut all_paths = base_paths.clone();
        for path in &base_paths {
            all_paths.insert(format!("len({path})"));
            if path.contains("[*]") {
                for f in AGGREGATE_FUNCTIONS {
                    all_paths.insert(format!("{f}({path})"));
                }
            }
        }
        all_paths.into_iter().collect()
    }

    fn walk_fields(
        &self,
        schema: &CompiledSchema,
        prefix: String,
        depth: usize,
        max_depth: usize,
        out: &mut std::collections::BTreeSet<String>,
    ) {
        if depth >= max_depth {
            return;
        }
        for field in &schema.fields {
            let base = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{prefix}.{}", field.name)
            };
            self.emit_type_paths(&field.field_type, base, depth, max_depth, out);
        }
    }

    fn emit_type_paths(
        &self,
        field_type: &FieldType,
        path: String,
        depth: usize,
        max_depth: usize,
        out: &mut std::collections::BTreeSet<String>,
    ) {
        out.insert(path.clone());
        match field_type {
            FieldType::Object(name) => {
                if let Some(schema) = self.schemas.get(name) {
                    self.walk_fields(schema, path, depth + 1, max_depth, out);
                }
            }
            FieldType::Array(inner) => {
                let wildcard_path = format!("{path}[*]");
                out.insert(wildcard_path.clone());
                self.emit_type_paths(inner, wildcard_path, depth + 1, max_depth, out);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Raw YAML document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawSchemaFile {
    resources: HashMap<String, RawResourceConfig>,
}

#[derive(Debug, Deserialize)]
struct RawResourceConfig {
    #[serde(default)]
    provider: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    collection_type: Option<String>,
    #[serde(default)]
    fields: HashMap<String, RawFieldDef>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFieldDef {
    /// A primitive keyword (`string`, `integer`, ...) or a reference to
    /// another schema's name.
    Scalar(String),
    /// An inline nested object.
    Nested(HashMap<String, RawFieldDef>),
    /// A single-element list denoting "array of" the element's type —
    /// mirrors the original generator's `[elem_def]` convention.
    Array(Vec<RawFieldDef>),
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Compile a YAML resource-schema document into a [`SchemaRegistry`].
///
/// # Errors
///
/// Returns an error only if the document itself fails to parse as YAML of
/// the expected shape; unresolved type references within an otherwise valid
/// document degrade gracefully (see module docs) rather than erroring.
pub fn compile(yaml: &str) -> Result<SchemaRegistry, SchemaError> {
    let raw: RawSchemaFile =
        serde_yaml::from_str(yaml).map_err(|e| SchemaError::Parse(e.to_string()))?;

    let mut schemas = HashMap::new();

    // Pass 1/2/3 collapse into one pass per top-level entry: name references
    // are resolved lazily (see module docs), so declaration order within the
    // document does not matter for field-type resolution.
    for (name, config) in &raw.resources {
        let kind = if config.collection_type.is_some() {
            SchemaKind::Collection
        } else if name.ends_with("Data") {
            SchemaKind::Data
        } else {
            SchemaKind::Resource
        };

        let fields = compile_fields(name, &config.fields, &mut schemas);
        schemas.insert(
            name.clone(),
            CompiledSchema {
                name: name.clone(),
                kind,
                provider: config.provider.clone(),
                description: config.description.clone(),
                collection_type: config.collection_type.clone(),
                fields,
            },
        );
    }

    // Resolve each collection's `resources` field against its declared
    // `collection_type`, now that every top-level name is known. Falls back
    // to leaving the collection as a plain resource (no synthetic
    // `resources` field) when the reference never resolves, matching the
    // original generator's behaviour for a dangling `collection_type`.
    let collection_names: Vec<String> = schemas
        .iter()
        .filter(|(_, s)| s.kind == SchemaKind::Collection)
        .map(|(name, _)| name.clone())
        .collect();
    for name in collection_names {
        let collection_type = schemas.get(&name).and_then(|s| s.collection_type.clone());
        match collection_type {
            Some(ref target) if schemas.contains_key(target) => {
                let schema = schemas.get_mut(&name).expect("just looked up");
                schema.fields.insert(
                    0,
                    FieldDef {
                        name: "resources".to_owned(),
                        field_type: FieldType::Array(Box::new(FieldType::Object(target.clone()))),
                    },
                );
            }
            Some(ref target) => {
                log::warn!(
                    "schema '{name}' declares collection_type '{target}' which was never defined; \
                     treating it as a plain resource"
                );
            }
            None => {}
        }
    }

    // Downgrade any reference that never resolved to a real schema name:
    // unknown-reference -> Any, per §4.1.
    let known: HashSet<String> = schemas.keys().cloned().collect();
    for schema in schemas.values_mut() {
        for field in &mut schema.fields {
            field.field_type = downgrade_unknown_refs(&field.field_type, &known, &schema.name, &field.name);
        }
    }

    Ok(SchemaRegistry { schemas })
}

fn downgrade_unknown_refs(
    field_type: &FieldType,
    known: &HashSet<String>,
    schema_name: &str,
    field_name: &str,
) -> FieldType {
    match field_type {
        FieldType::Object(name) => {
            if known.contains(name) {
                field_type.clone()
            } else {
                log::warn!(
                    "field '{schema_name}.{field_name}' references unknown schema '{name}'; \
                     falling back to an untyped value"
                );
                FieldType::Any
            }
        }
        FieldType::Array(inner) => FieldType::Array(Box::new(downgrade_unknown_refs(
            inner,
            known,
            schema_name,
            field_name,
        ))),
        other => other.clone(),
    }
}

/// Resolve one raw field definition into a [`FieldType`], synthesising and
/// registering nested schemas for inline object/array-of-object fields
/// exactly as the original generator names them: `{prefix}_{Field_Name}`
/// for nested objects, `{prefix}_{Field_Name}Item` for array elements.
fn resolve_field_type(
    prefix: &str,
    field_name: &str,
    field_def: &RawFieldDef,
    schemas: &mut HashMap<String, CompiledSchema>,
) -> FieldType {
    match field_def {
        RawFieldDef::Scalar(keyword) => parse_primitive(keyword)
            .unwrap_or_else(|| FieldType::Object(keyword.clone())),
        RawFieldDef::Nested(fields) => {
            let synthetic_name = format!("{prefix}_{}", title_case(field_name));
            let compiled = compile_fields(&synthetic_name, fields, schemas);
            schemas.insert(
                synthetic_name.clone(),
                CompiledSchema {
                    name: synthetic_name.clone(),
                    kind: SchemaKind::Data,
                    provider: String::new(),
                    description: String::new(),
                    collection_type: None,
                    fields: compiled,
                },
            );
            FieldType::Object(synthetic_name)
        }
        RawFieldDef::Array(elems) => {
            let Some(elem_def) = elems.first() else {
                return FieldType::Array(Box::new(FieldType::Any));
            };
            let elem_type = match elem_def {
                RawFieldDef::Nested(fields) => {
                    let synthetic_name = format!("{prefix}_{}Item", title_case(field_name));
                    let compiled = compile_fields(&synthetic_name, fields, schemas);
                    schemas.insert(
                        synthetic_name.clone(),
                        CompiledSchema {
                            name: synthetic_name.clone(),
                            kind: SchemaKind::Data,
                            provider: String::new(),
                            description: String::new(),
                            collection_type: None,
                            fields: compiled,
                        },
                    );
                    FieldType::Object(synthetic_name)
                }
                _ => resolve_field_type(prefix, field_name, elem_def, schemas),
            };
            FieldType::Array(Box::new(elem_type))
        }
    }
}

fn compile_fields(
    prefix: &str,
    fields: &HashMap<String, RawFieldDef>,
    schemas: &mut HashMap<String, CompiledSchema>,
) -> Vec<FieldDef> {
    let mut names: Vec<&String> = fields.keys().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| FieldDef {
            name: name.clone(),
            field_type: resolve_field_type(prefix, name, &fields[name], schemas),
        })
        .collect()
}

fn parse_primitive(keyword: &str) -> Option<FieldType> {
    match keyword {
        "string" => Some(FieldType::String),
        "integer" => Some(FieldType::Integer),
        "boolean" => Some(FieldType::Boolean),
        "float" | "number" => Some(FieldType::Float),
        "datetime" => Some(FieldType::Datetime),
        "object" | "any" => Some(FieldType::Any),
        "array" => Some(FieldType::Array(Box::new(FieldType::Any))),
        _ => None,
    }
}

/// Python-`str.title()`-equivalent: capitalise the first letter following
/// the start of the string or any non-alphanumeric character, matching the
/// naming the original dynamic-model generator used for synthetic schemas.
fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut capitalize_next = true;
    for ch in s.chars() {
        if ch.is_alphanumeric() {
            if capitalize_next {
                out.extend(ch.to_uppercase());
                capitalize_next = false;
            } else {
                out.extend(ch.to_lowercase());
            }
        } else {
            out.push(ch);
            capitalize_next = true;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to parse schema document: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
resources:
  GithubRepositoryData:
    provider: github
    fields:
      private: boolean
      description: string

  GithubBranchData:
    provider: github
    fields:
      name: string
      protected: boolean

  GithubResource:
    provider: github
    fields:
      repository_data: GithubRepositoryData
      branches: [GithubBranchData]
      tags: [string]
      unknown_ref: SomethingThatDoesNotExist

  GithubResourceCollection:
    provider: github
    collection_type: GithubResource
    fields:
      source_connector: string

  OrphanCollection:
    provider: github
    collection_type: DoesNotExist
    fields:
      note: string
"#;

    #[test]
    fn test_compile_resolves_references() {
        let registry = compile(DOC).unwrap();
        let resource = registry.get("GithubResource").unwrap();
        let repo_field = resource.fields.iter().find(|f| f.name == "repository_data").unwrap();
        assert_eq!(
            repo_field.field_type,
            FieldType::Object("GithubRepositoryData".to_owned())
        );
    }

    #[test]
    fn test_compile_resolves_array_of_reference() {
        let registry = compile(DOC).unwrap();
        let resource = registry.get("GithubResource").unwrap();
        let branches = resource.fields.iter().find(|f| f.name == "branches").unwrap();
        assert_eq!(
            branches.field_type,
            FieldType::Array(Box::new(FieldType::Object("GithubBranchData".to_owned())))
        );
    }

    #[test]
    fn test_unknown_reference_downgrades_to_any() {
        let registry = compile(DOC).unwrap();
        let resource = registry.get("GithubResource").unwrap();
        let unknown = resource.fields.iter().find(|f| f.name == "unknown_ref").unwrap();
        assert_eq!(unknown.field_type, FieldType::Any);
    }

    #[test]
    fn test_collection_gets_typed_resources_field() {
        let registry = compile(DOC).unwrap();
        let collection = registry.get("GithubResourceCollection").unwrap();
        let resources = collection.fields.iter().find(|f| f.name == "resources").unwrap();
        assert_eq!(
            resources.field_type,
            FieldType::Array(Box::new(FieldType::Object("GithubResource".to_owned())))
        );
    }

    #[test]
    fn test_orphan_collection_type_falls_back_to_plain_resource() {
        let registry = compile(DOC).unwrap();
        let orphan = registry.get("OrphanCollection").unwrap();
        assert!(orphan.fields.iter().all(|f| f.name != "resources"));
    }

    #[test]
    fn test_field_paths_includes_nested_and_array_forms() {
        let registry = compile(DOC).unwrap();
        let paths = registry.field_paths("GithubResource", 4);
        assert!(paths.contains(&"repository_data.private".to_owned()));
        assert!(paths.contains(&"branches[*]".to_owned()));
        assert!(paths.contains(&"branches[*].name".to_owned()));
        assert!(paths.contains(&"len(branches[*])".to_owned()));
        assert!(paths.contains(&"any(branches[*].protected)".to_owned()));
        assert!(paths.contains(&"id".to_owned()));
        assert!(paths.contains(&"source_connector".to_owned()));
    }

    #[test]
    fn test_fully_qualified_name() {
        assert_eq!(
            SchemaRegistry::fully_qualified_name("github", "GithubResource"),
            "con_mon_v2.mappings.github.GithubResource"
        );
    }

    #[test]
    fn test_title_case_matches_python_semantics() {
        assert_eq!(title_case("repository_data"), "Repository_Data");
        assert_eq!(title_case("name"), "Name");
    }
}
