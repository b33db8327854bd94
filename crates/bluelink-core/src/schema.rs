//! The parsed blueprint model consumed by the engine.
//!
//! Parsing, validation and reference-graph construction all happen upstream;
//! the engine receives this already-parsed form together with a substitution
//! resolver that knows how to evaluate the substitutions still embedded in
//! the `spec` documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A parsed blueprint document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blueprint {
    /// Declared resources keyed by logical name.
    #[serde(default)]
    pub resources: HashMap<String, ResourceDef>,
    /// Child blueprint includes keyed by include name.
    #[serde(default)]
    pub includes: HashMap<String, IncludeDef>,
    /// Exported fields keyed by export name.
    #[serde(default)]
    pub exports: HashMap<String, ExportDef>,
    /// Free-form blueprint metadata.
    #[serde(default)]
    pub metadata: Value,
}

/// A resource declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    /// Provider resource type, e.g. `aws/dynamodb/table`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Template binding. When set, the resource is a template that expands
    /// into one concrete resource per element of the resolved list.
    #[serde(default)]
    pub each: Option<Value>,
    /// Explicit ordering dependencies (names of other resources or includes).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Unresolved spec document with substitutions still embedded.
    #[serde(default)]
    pub spec: Value,
    /// Resource metadata (display name, labels).
    #[serde(default)]
    pub metadata: Value,
}

/// A child blueprint include.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeDef {
    /// Where the child blueprint lives. Local relative/absolute paths,
    /// `https://` and `{s3,gcs,azureblob}://{bucket}/{path}` are understood
    /// by the stock child resolvers.
    pub path: String,
    /// Variables passed down to the child blueprint.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: Value,
}

/// An exported field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDef {
    #[serde(rename = "type")]
    pub export_type: String,
    /// Field path into the blueprint that produces the exported value.
    pub field: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Blueprint {
    /// Resource names declared in this blueprint, templates included.
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    pub fn is_template(&self, resource_name: &str) -> bool {
        self.resources
            .get(resource_name)
            .is_some_and(|def| def.each.is_some())
    }
}
