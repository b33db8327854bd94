//! Substitution, child blueprint and link resolution seams.
//!
//! Substitution grammar and reference-graph construction live upstream; the
//! engine drives these traits with a stage tag so resolvers can distinguish
//! change staging (where unresolved values are tolerated and reported) from
//! deployment (where everything must resolve).

use crate::error::{Error, Result};
use crate::schema::{Blueprint, ExportDef, IncludeDef, ResourceDef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Context variable: the id of the parent instance, passed to children.
pub const CONTEXT_PARENT_INSTANCE_ID: &str = "parentInstanceID";
/// Context variable: `/`-joined instance ids from the root to the current
/// instance, used for include cycle detection.
pub const CONTEXT_INSTANCE_TREE_PATH: &str = "instanceTreePath";
/// Context variable: `/`-joined include names from the root.
pub const CONTEXT_INCLUDE_TREE_PATH: &str = "includeTreePath";
/// Context variable: directory of the blueprint document, for resolving
/// relative include paths.
pub const CONTEXT_BLUEPRINT_DIR: &str = "__blueprintDir";

/// Which phase a resolution is being performed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveStage {
    /// Staging changes: unresolved substitutions are collected, not errors.
    ChangeStaging,
    /// Deploying: dependency outputs are available and everything must
    /// resolve.
    Deployment,
}

/// Parameter overrides and context variables for a single run.
#[derive(Debug, Clone, Default)]
pub struct BlueprintParams {
    /// Caller-supplied variable overrides.
    pub variables: HashMap<String, Value>,
    /// Engine-managed context variables (see the `CONTEXT_*` constants).
    pub context: HashMap<String, Value>,
}

impl BlueprintParams {
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Template item bound while resolving a concrete resource expanded from a
/// template.
#[derive(Debug, Clone)]
pub struct TemplateItemContext {
    pub template_name: String,
    pub index: usize,
    pub item: Value,
}

/// A resource spec after substitution resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedResource {
    pub spec: Value,
    pub metadata: Value,
    /// Field paths that could not be resolved at this stage. Must be empty
    /// when resolving for deployment.
    pub unresolved_paths: Vec<String>,
}

/// An include after substitution resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInclude {
    pub path: String,
    pub variables: HashMap<String, Value>,
    pub unresolved_paths: Vec<String>,
}

/// An export after substitution resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedExport {
    /// The export value; `None` when only known on deploy.
    pub value: Option<Value>,
    pub unresolved: bool,
}

/// Resolves the substitutions embedded in blueprint elements.
#[async_trait]
pub trait SubstitutionResolver: Send + Sync {
    /// Resolve a template resource's `each` binding into concrete items.
    async fn resolve_each(
        &self,
        stage: ResolveStage,
        resource_name: &str,
        def: &ResourceDef,
        params: &BlueprintParams,
    ) -> Result<Vec<Value>>;

    /// Resolve a concrete resource's spec and metadata. `template` carries
    /// the bound item when the resource was expanded from a template.
    async fn resolve_resource(
        &self,
        stage: ResolveStage,
        resource_name: &str,
        def: &ResourceDef,
        params: &BlueprintParams,
        template: Option<&TemplateItemContext>,
    ) -> Result<ResolvedResource>;

    async fn resolve_include(
        &self,
        stage: ResolveStage,
        include_name: &str,
        def: &IncludeDef,
        params: &BlueprintParams,
    ) -> Result<ResolvedInclude>;

    async fn resolve_export(
        &self,
        stage: ResolveStage,
        export_name: &str,
        def: &ExportDef,
        params: &BlueprintParams,
    ) -> Result<ResolvedExport>;

    /// Names of blueprint elements a resource's substitutions reference,
    /// contributing ordering edges beyond `depends_on`.
    fn resource_references(&self, resource_name: &str, def: &ResourceDef) -> Vec<String>;

    /// Names of blueprint elements an include's substitutions reference.
    fn include_references(&self, include_name: &str, def: &IncludeDef) -> Vec<String>;
}

/// Where a resolved child blueprint can be loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildBlueprintInfo {
    /// The blueprint document itself.
    Source(String),
    /// An absolute path on the local filesystem.
    AbsolutePath(String),
}

/// Scheme of a child blueprint include path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludePathScheme {
    Local,
    Https,
    S3,
    Gcs,
    AzureBlob,
}

/// Classify an include path by scheme. Anything without a recognised scheme
/// is treated as a local path.
pub fn include_path_scheme(path: &str) -> Result<IncludePathScheme> {
    let Ok(parsed) = url::Url::parse(path) else {
        return Ok(IncludePathScheme::Local);
    };
    match parsed.scheme() {
        "https" => Ok(IncludePathScheme::Https),
        "s3" => Ok(IncludePathScheme::S3),
        "gcs" => Ok(IncludePathScheme::Gcs),
        "azureblob" => Ok(IncludePathScheme::AzureBlob),
        "file" => Ok(IncludePathScheme::Local),
        other => Err(Error::ChildResolveFailed {
            include: path.to_string(),
            message: format!("unsupported include path scheme: {other}"),
        }),
    }
}

/// Loads child blueprint documents from their include paths.
#[async_trait]
pub trait ChildResolver: Send + Sync {
    async fn resolve(
        &self,
        include_name: &str,
        include: &ResolvedInclude,
        params: &BlueprintParams,
    ) -> Result<ChildBlueprintInfo>;
}

/// Parses a child blueprint document into its schema form. Parsing lives
/// upstream; the engine only needs this seam to recurse into includes.
#[async_trait]
pub trait BlueprintLoader: Send + Sync {
    async fn load(
        &self,
        info: &ChildBlueprintInfo,
        params: &BlueprintParams,
    ) -> Result<Blueprint>;
}

/// A link implied by the blueprint, in deploy priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkIntent {
    pub resource_a: String,
    pub resource_b: String,
}

/// Reports the links a blueprint implies between its resources (template
/// names included, pre-expansion).
pub trait LinkOracle: Send + Sync {
    fn links(&self, blueprint: &Blueprint) -> Vec<LinkIntent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_path_schemes() {
        assert_eq!(
            include_path_scheme("core-infra.blueprint.yaml").unwrap(),
            IncludePathScheme::Local
        );
        assert_eq!(
            include_path_scheme("/abs/path/child.blueprint.yaml").unwrap(),
            IncludePathScheme::Local
        );
        assert_eq!(
            include_path_scheme("https://example.com/child.yaml").unwrap(),
            IncludePathScheme::Https
        );
        assert_eq!(
            include_path_scheme("s3://bucket/child.yaml").unwrap(),
            IncludePathScheme::S3
        );
        assert_eq!(
            include_path_scheme("gcs://bucket/child.yaml").unwrap(),
            IncludePathScheme::Gcs
        );
        assert_eq!(
            include_path_scheme("azureblob://container/child.yaml").unwrap(),
            IncludePathScheme::AzureBlob
        );
        assert!(include_path_scheme("ftp://host/child.yaml").is_err());
    }
}
