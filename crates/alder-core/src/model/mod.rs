//! Uniform reflection capability over parsed model elements.
//!
//! Format parsers turn file bytes into elements exposing identity, type,
//! attribute and reference slots through [`ModelElement`]. The
//! synchronisation engine depends only on this capability, never on a
//! concrete format.

pub mod json;
mod signature;

pub use signature::signature_of;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::PropertyValue;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Qualified type reference: owning metamodel URI plus type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeRef {
    pub metamodel: String,
    pub name: String,
}

impl TypeRef {
    pub fn new(metamodel: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metamodel: metamodel.into(),
            name: name.into(),
        }
    }

    /// Parses `"metamodelURI#TypeName"`, falling back to `default_metamodel`
    /// for a bare type name.
    pub fn parse(text: &str, default_metamodel: &str) -> Self {
        match text.split_once('#') {
            Some((metamodel, name)) if !metamodel.is_empty() => Self::new(metamodel, name),
            Some((_, name)) => Self::new(default_metamodel, name),
            None => Self::new(default_metamodel, text),
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.metamodel, self.name)
    }
}

/// One reference target, as written in the model file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementRef {
    /// Repository-relative path of the file expected to hold the target.
    /// `None` targets the referencing file itself or a fragment-unique
    /// singleton.
    pub path: Option<String>,
    pub fragment: String,
}

impl ElementRef {
    pub fn local(fragment: impl Into<String>) -> Self {
        Self {
            path: None,
            fragment: fragment.into(),
        }
    }

    pub fn in_file(path: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            fragment: fragment.into(),
        }
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}#{}", path, self.fragment),
            None => write!(f, "#{}", self.fragment),
        }
    }
}

/// Identity of an element across versions of its repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    /// Scoped to the owning file.
    Scoped { path: String, fragment: String },
    /// Fragment-unique singleton, shared across files.
    Unique { fragment: String },
}

impl IdentityKey {
    pub fn of(element: &dyn ModelElement, path: &str) -> Self {
        if element.is_fragment_unique() {
            Self::Unique {
                fragment: element.uri_fragment().to_string(),
            }
        } else {
            Self::Scoped {
                path: path.to_string(),
                fragment: element.uri_fragment().to_string(),
            }
        }
    }

    pub fn fragment(&self) -> &str {
        match self {
            Self::Scoped { fragment, .. } | Self::Unique { fragment } => fragment,
        }
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, Self::Unique { .. })
    }
}

/// Capability every parsed element exposes, regardless of format.
pub trait ModelElement: Send + Sync {
    /// Fragment identifying this element within its file (or globally, when
    /// [`is_fragment_unique`](Self::is_fragment_unique) holds).
    fn uri_fragment(&self) -> &str;

    /// Identity by fragment alone, shared across files.
    fn is_fragment_unique(&self) -> bool;

    /// Whether this element is a root of its file's containment forest.
    fn is_root(&self) -> bool;

    fn type_ref(&self) -> &TypeRef;

    /// Whether the named slot carries a value at all. Unset slots are not
    /// materialised in the graph.
    fn is_feature_set(&self, name: &str) -> bool;

    fn attribute(&self, name: &str) -> Option<PropertyValue>;

    /// Names of all set attribute slots.
    fn attribute_names(&self) -> Vec<String>;

    /// Targets of the named reference slot. `resolve_proxies` lets a parser
    /// materialise cross-file targets itself; the engine always passes
    /// `false` and resolves them through the graph instead.
    fn reference(&self, name: &str, resolve_proxies: bool) -> Option<Vec<ElementRef>>;

    /// Names of all set reference slots.
    fn reference_names(&self) -> Vec<String>;

    /// Content signature; equal content always yields an equal signature.
    fn signature(&self) -> String;
}

/// Parsed contents of one model file.
pub struct ParsedModel {
    pub elements: Vec<Arc<dyn ModelElement>>,
}

impl fmt::Debug for ParsedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedModel")
            .field("elements", &self.elements.len())
            .finish()
    }
}

/// Format parser adapter: file bytes in, reflection-capable elements out.
#[async_trait]
pub trait ModelParser: Send + Sync {
    /// Stable identifier, e.g. for log lines.
    fn id(&self) -> &str;

    fn can_parse(&self, path: &Path) -> bool;

    async fn parse(&self, path: &Path) -> Result<ParsedModel, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ref_parse() {
        let qualified = TypeRef::parse("http://example.org/tree#Tree", "fallback");
        assert_eq!(qualified.metamodel, "http://example.org/tree");
        assert_eq!(qualified.name, "Tree");

        let bare = TypeRef::parse("Tree", "fallback");
        assert_eq!(bare.metamodel, "fallback");
        assert_eq!(bare.name, "Tree");
    }

    #[test]
    fn test_identity_key_fragment() {
        let scoped = IdentityKey::Scoped {
            path: "a.model.json".to_string(),
            fragment: "t1".to_string(),
        };
        let unique = IdentityKey::Unique {
            fragment: "t1".to_string(),
        };
        assert_eq!(scoped.fragment(), "t1");
        assert_eq!(unique.fragment(), "t1");
        assert_ne!(scoped, unique);
        assert!(unique.is_unique());
    }
}
