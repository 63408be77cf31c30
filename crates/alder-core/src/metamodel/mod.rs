//! Type systems: descriptors, the metamodel parser adapter, the registry
//! and effective-metamodel filters.

mod effective;
mod registry;

pub use effective::{EffectiveMetamodel, Rule, WILDCARD};
pub use registry::{DerivedSpec, MetamodelRegistry, INDEX_METAMODELS};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::GraphError;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("metamodel not registered: {0}")]
    MetamodelNotFound(String),

    #[error("type '{name}' not found in metamodel '{metamodel}'")]
    TypeNotFound { metamodel: String, name: String },

    #[error("slot '{slot}' not declared on '{metamodel}#{name}'")]
    SlotNotFound {
        metamodel: String,
        name: String,
        slot: String,
    },

    #[error("failed to read metamodel file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse metamodel {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("no metamodel parser accepts {0}")]
    NoParser(PathBuf),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("metamodel snapshot (de)serialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// A registered type system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetamodelDescriptor {
    pub uri: String,
    #[serde(default)]
    pub version: String,
    /// URIs of metamodels this one references; they must already be
    /// registered.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub types: Vec<TypeDescriptor>,
}

impl MetamodelDescriptor {
    pub fn type_named(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default, rename = "interface")]
    pub is_interface: bool,
    /// Supertype names, either bare (same metamodel) or `"uri#Name"`.
    #[serde(default)]
    pub supertypes: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<SlotDescriptor>,
    #[serde(default)]
    pub references: Vec<SlotDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDescriptor {
    pub name: String,
    #[serde(default)]
    pub many: bool,
    #[serde(default = "default_true")]
    pub ordered: bool,
    #[serde(default = "default_true")]
    pub unique: bool,
    /// The targets are owned by this element.
    #[serde(default)]
    pub containment: bool,
    /// The target owns this element.
    #[serde(default)]
    pub container: bool,
}

fn default_true() -> bool {
    true
}

/// Metamodel parser adapter: declaration files in, descriptors out.
#[async_trait]
pub trait MetamodelParser: Send + Sync {
    fn id(&self) -> &str;

    fn can_parse(&self, path: &Path) -> bool;

    async fn parse(&self, path: &Path) -> Result<MetamodelDescriptor, RegistryError>;

    /// Textual snapshot persisted into the graph at registration, so the
    /// type system can be rebuilt on restart without the original sources.
    fn dump_to_text(&self, descriptor: &MetamodelDescriptor) -> Result<String, RegistryError> {
        Ok(serde_json::to_string_pretty(descriptor)?)
    }
}

/// File name suffix recognised by [`JsonMetamodelParser`].
pub const METAMODEL_SUFFIX: &str = ".metamodel.json";

/// Parser for JSON metamodel declarations, the counterpart of the fixture
/// model format.
#[derive(Debug, Default)]
pub struct JsonMetamodelParser;

impl JsonMetamodelParser {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetamodelParser for JsonMetamodelParser {
    fn id(&self) -> &str {
        "json-metamodel"
    }

    fn can_parse(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().ends_with(METAMODEL_SUFFIX))
            .unwrap_or(false)
    }

    async fn parse(&self, path: &Path) -> Result<MetamodelDescriptor, RegistryError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|err| RegistryError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_deserialization_defaults() {
        let text = r#"{
            "uri": "http://example.org/tree",
            "types": [
                { "name": "Node", "abstract": true,
                  "attributes": [{ "name": "label" }] },
                { "name": "Tree", "supertypes": ["Node"],
                  "references": [
                    { "name": "children", "many": true, "containment": true },
                    { "name": "parent", "container": true }
                  ] }
            ]
        }"#;
        let descriptor: MetamodelDescriptor = serde_json::from_str(text).unwrap();

        assert_eq!(descriptor.uri, "http://example.org/tree");
        assert_eq!(descriptor.version, "");
        let node = descriptor.type_named("Node").unwrap();
        assert!(node.is_abstract);
        assert!(node.attributes[0].ordered);
        assert!(node.attributes[0].unique);
        assert!(!node.attributes[0].many);

        let tree = descriptor.type_named("Tree").unwrap();
        assert_eq!(tree.supertypes, vec!["Node".to_string()]);
        assert!(tree.references[0].containment);
        assert!(tree.references[1].container);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let descriptor = MetamodelDescriptor {
            uri: "mm".to_string(),
            version: "1.2".to_string(),
            dependencies: vec!["base".to_string()],
            types: vec![TypeDescriptor {
                name: "T".to_string(),
                is_abstract: false,
                is_interface: false,
                supertypes: vec![],
                attributes: vec![],
                references: vec![],
            }],
        };

        let parser = JsonMetamodelParser::new();
        let text = parser.dump_to_text(&descriptor).unwrap();
        let back: MetamodelDescriptor = serde_json::from_str(&text).unwrap();
        assert_eq!(back.uri, "mm");
        assert_eq!(back.version, "1.2");
        assert_eq!(back.dependencies, vec!["base".to_string()]);
        assert_eq!(back.types.len(), 1);
    }
}
