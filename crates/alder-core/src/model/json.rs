//! JSON fixture model format.
//!
//! One `*.model.json` file lists the elements of one model file:
//!
//! ```json
//! {
//!   "metamodel": "http://example.org/tree",
//!   "elements": [
//!     { "fragment": "t6", "type": "Tree", "root": true,
//!       "attributes": { "label": "root" },
//!       "references": { "children": ["#t3", "#t5"] } }
//!   ]
//! }
//! ```
//!
//! Reference targets are written `"#fragment"` (same file, or a
//! fragment-unique singleton) or `"path#fragment"` (cross-file). A bare
//! `"fragment"` is shorthand for the same-file form. Element types default
//! to the file's metamodel; `"type": "otherMM#Name"` overrides it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::{
    signature_of, ElementRef, ModelElement, ModelError, ModelParser, ParsedModel, TypeRef,
};
use crate::graph::PropertyValue;

/// File name suffix recognised by [`JsonModelParser`].
pub const MODEL_SUFFIX: &str = ".model.json";

#[derive(Deserialize)]
struct ModelFile {
    metamodel: String,
    #[serde(default)]
    elements: Vec<ElementRecord>,
}

#[derive(Deserialize)]
struct ElementRecord {
    fragment: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    root: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    attributes: BTreeMap<String, JsonValue>,
    #[serde(default)]
    references: BTreeMap<String, Vec<String>>,
}

/// One element of a parsed fixture model.
pub struct JsonElement {
    fragment: String,
    type_ref: TypeRef,
    root: bool,
    unique: bool,
    attributes: BTreeMap<String, PropertyValue>,
    references: BTreeMap<String, Vec<ElementRef>>,
    signature: OnceLock<String>,
}

impl JsonElement {
    fn from_record(record: ElementRecord, metamodel: &str, path: &Path) -> Result<Self, ModelError> {
        let mut attributes = BTreeMap::new();
        for (name, value) in record.attributes {
            let converted = property_from_json(&value).map_err(|message| ModelError::Parse {
                path: path.to_path_buf(),
                message: format!("attribute '{}' of '{}': {}", name, record.fragment, message),
            })?;
            attributes.insert(name, converted);
        }

        let references = record
            .references
            .into_iter()
            .map(|(name, targets)| {
                let targets = targets.iter().map(|t| parse_target(t)).collect();
                (name, targets)
            })
            .collect();

        Ok(Self {
            fragment: record.fragment,
            type_ref: TypeRef::parse(&record.type_name, metamodel),
            root: record.root,
            unique: record.unique,
            attributes,
            references,
            signature: OnceLock::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        fragment: &str,
        metamodel: &str,
        type_name: &str,
        attributes: &[(&str, PropertyValue)],
        references: &[(&str, Vec<ElementRef>)],
    ) -> Self {
        Self {
            fragment: fragment.to_string(),
            type_ref: TypeRef::new(metamodel, type_name),
            root: false,
            unique: false,
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            references: references
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            signature: OnceLock::new(),
        }
    }
}

impl ModelElement for JsonElement {
    fn uri_fragment(&self) -> &str {
        &self.fragment
    }

    fn is_fragment_unique(&self) -> bool {
        self.unique
    }

    fn is_root(&self) -> bool {
        self.root
    }

    fn type_ref(&self) -> &TypeRef {
        &self.type_ref
    }

    fn is_feature_set(&self, name: &str) -> bool {
        self.attributes.contains_key(name) || self.references.contains_key(name)
    }

    fn attribute(&self, name: &str) -> Option<PropertyValue> {
        self.attributes.get(name).cloned()
    }

    fn attribute_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    fn reference(&self, name: &str, _resolve_proxies: bool) -> Option<Vec<ElementRef>> {
        self.references.get(name).cloned()
    }

    fn reference_names(&self) -> Vec<String> {
        self.references.keys().cloned().collect()
    }

    fn signature(&self) -> String {
        self.signature.get_or_init(|| signature_of(self)).clone()
    }
}

/// `"#frag"` and `"frag"` are same-file targets; `"path#frag"` crosses files.
fn parse_target(text: &str) -> ElementRef {
    match text.split_once('#') {
        Some(("", fragment)) => ElementRef::local(fragment),
        Some((path, fragment)) => ElementRef::in_file(path, fragment),
        None => ElementRef::local(text),
    }
}

fn property_from_json(value: &JsonValue) -> Result<PropertyValue, String> {
    match value {
        JsonValue::Bool(b) => Ok(PropertyValue::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(PropertyValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(PropertyValue::Float(f))
            } else {
                Err(format!("number out of range: {}", n))
            }
        }
        JsonValue::String(s) => Ok(PropertyValue::Str(s.clone())),
        JsonValue::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                match property_from_json(item)? {
                    PropertyValue::List(_) => {
                        return Err("nested lists are not supported".to_string())
                    }
                    scalar => list.push(scalar),
                }
            }
            Ok(PropertyValue::List(list))
        }
        JsonValue::Null => Err("null attribute values are not supported".to_string()),
        JsonValue::Object(_) => Err("object attribute values are not supported".to_string()),
    }
}

/// Parser for the fixture model format.
#[derive(Debug, Default)]
pub struct JsonModelParser;

impl JsonModelParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_text(&self, text: &str, path: &Path) -> Result<ParsedModel, ModelError> {
        let file: ModelFile = serde_json::from_str(text).map_err(|err| ModelError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let mut seen = BTreeSet::new();
        let mut elements: Vec<Arc<dyn ModelElement>> = Vec::with_capacity(file.elements.len());
        for record in file.elements {
            if !seen.insert(record.fragment.clone()) {
                return Err(ModelError::Parse {
                    path: path.to_path_buf(),
                    message: format!("duplicate fragment '{}'", record.fragment),
                });
            }
            elements.push(Arc::new(JsonElement::from_record(
                record,
                &file.metamodel,
                path,
            )?));
        }
        Ok(ParsedModel { elements })
    }
}

#[async_trait]
impl ModelParser for JsonModelParser {
    fn id(&self) -> &str {
        "json-model"
    }

    fn can_parse(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().ends_with(MODEL_SUFFIX))
            .unwrap_or(false)
    }

    async fn parse(&self, path: &Path) -> Result<ParsedModel, ModelError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ModelError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        self.parse_text(&text, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = r##"{
        "metamodel": "http://example.org/tree",
        "elements": [
            { "fragment": "t6", "type": "Tree", "root": true,
              "attributes": { "label": "root", "weight": 3 },
              "references": { "children": ["#t3", "t5"] } },
            { "fragment": "t3", "type": "Tree",
              "references": { "children": ["#t4"] } },
            { "fragment": "t4", "type": "Tree" },
            { "fragment": "t5", "type": "Tree" }
        ]
    }"##;

    fn parse(text: &str) -> ParsedModel {
        JsonModelParser::new()
            .parse_text(text, Path::new("fixture.model.json"))
            .unwrap()
    }

    #[test]
    fn test_parse_elements() {
        let model = parse(TREE);
        assert_eq!(model.elements.len(), 4);

        let t6 = &model.elements[0];
        assert_eq!(t6.uri_fragment(), "t6");
        assert!(t6.is_root());
        assert!(!t6.is_fragment_unique());
        assert_eq!(t6.type_ref(), &TypeRef::new("http://example.org/tree", "Tree"));
        assert_eq!(t6.attribute("label"), Some("root".into()));
        assert_eq!(t6.attribute("weight"), Some(PropertyValue::Int(3)));
        assert_eq!(
            t6.reference("children", false),
            Some(vec![ElementRef::local("t3"), ElementRef::local("t5")])
        );
        assert!(t6.is_feature_set("children"));
        assert!(!t6.is_feature_set("parent"));
    }

    #[test]
    fn test_cross_file_target() {
        assert_eq!(
            parse_target("shared/base.model.json#lib"),
            ElementRef::in_file("shared/base.model.json", "lib")
        );
        assert_eq!(parse_target("#t1"), ElementRef::local("t1"));
        assert_eq!(parse_target("t1"), ElementRef::local("t1"));
    }

    #[test]
    fn test_duplicate_fragment_rejected() {
        let text = r#"{
            "metamodel": "mm",
            "elements": [
                { "fragment": "t1", "type": "Tree" },
                { "fragment": "t1", "type": "Tree" }
            ]
        }"#;
        let err = JsonModelParser::new()
            .parse_text(text, Path::new("dup.model.json"))
            .unwrap_err();
        assert!(matches!(err, ModelError::Parse { .. }));
    }

    #[test]
    fn test_unsupported_attribute_value_rejected() {
        let text = r#"{
            "metamodel": "mm",
            "elements": [
                { "fragment": "t1", "type": "Tree",
                  "attributes": { "nested": { "x": 1 } } }
            ]
        }"#;
        assert!(JsonModelParser::new()
            .parse_text(text, Path::new("bad.model.json"))
            .is_err());
    }

    #[test]
    fn test_can_parse() {
        let parser = JsonModelParser::new();
        assert!(parser.can_parse(Path::new("dir/fixture.model.json")));
        assert!(!parser.can_parse(Path::new("dir/fixture.metamodel.json")));
        assert!(!parser.can_parse(Path::new("notes.txt")));
    }
}
