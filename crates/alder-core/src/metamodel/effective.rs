//! Effective-metamodel filters.
//!
//! A rule table over (metamodel URI, type name, slot name) limiting which
//! parts of a type system are materialised in the graph. Inclusion at a
//! level holds when there are no inclusion rules at all, or some inclusion
//! rule matches that level (possibly through a wildcard). Exclusion
//! overrides inclusion whenever an exclusion rule matches the level exactly,
//! with wildcards at every finer level. The three levels are evaluated
//! independently.

use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub metamodel: String,
    #[serde(default = "wildcard")]
    pub type_name: String,
    #[serde(default = "wildcard")]
    pub slot: String,
}

fn wildcard() -> String {
    WILDCARD.to_string()
}

impl Rule {
    pub fn metamodel(uri: impl Into<String>) -> Self {
        Self {
            metamodel: uri.into(),
            type_name: wildcard(),
            slot: wildcard(),
        }
    }

    pub fn of_type(uri: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            metamodel: uri.into(),
            type_name: type_name.into(),
            slot: wildcard(),
        }
    }

    pub fn of_slot(
        uri: impl Into<String>,
        type_name: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        Self {
            metamodel: uri.into(),
            type_name: type_name.into(),
            slot: slot.into(),
        }
    }

    fn matches_metamodel(&self, uri: &str) -> bool {
        self.metamodel == WILDCARD || self.metamodel == uri
    }

    fn matches_type(&self, uri: &str, type_name: &str) -> bool {
        self.matches_metamodel(uri) && (self.type_name == WILDCARD || self.type_name == type_name)
    }

    fn matches_slot(&self, uri: &str, type_name: &str, slot: &str) -> bool {
        self.matches_type(uri, type_name) && (self.slot == WILDCARD || self.slot == slot)
    }
}

/// Empty rule sets include everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectiveMetamodel {
    #[serde(default)]
    pub includes: Vec<Rule>,
    #[serde(default)]
    pub excludes: Vec<Rule>,
}

impl EffectiveMetamodel {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn includes_metamodel(&self, uri: &str) -> bool {
        let included =
            self.includes.is_empty() || self.includes.iter().any(|r| r.matches_metamodel(uri));
        let excluded = self
            .excludes
            .iter()
            .any(|r| r.matches_metamodel(uri) && r.type_name == WILDCARD && r.slot == WILDCARD);
        included && !excluded
    }

    pub fn includes_type(&self, uri: &str, type_name: &str) -> bool {
        let included =
            self.includes.is_empty() || self.includes.iter().any(|r| r.matches_type(uri, type_name));
        let excluded = self
            .excludes
            .iter()
            .any(|r| r.matches_type(uri, type_name) && r.slot == WILDCARD);
        included && !excluded
    }

    pub fn includes_slot(&self, uri: &str, type_name: &str, slot: &str) -> bool {
        let included = self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|r| r.matches_slot(uri, type_name, slot));
        let excluded = self
            .excludes
            .iter()
            .any(|r| r.matches_slot(uri, type_name, slot));
        included && !excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MM: &str = "http://example.org/tree";

    #[test]
    fn test_empty_ruleset_includes_everything() {
        let em = EffectiveMetamodel::everything();
        assert!(em.includes_metamodel(MM));
        assert!(em.includes_type(MM, "Tree"));
        assert!(em.includes_slot(MM, "Tree", "children"));
    }

    #[test]
    fn test_inclusion_restricts_other_metamodels() {
        let em = EffectiveMetamodel {
            includes: vec![Rule::metamodel(MM)],
            excludes: vec![],
        };
        assert!(em.includes_metamodel(MM));
        assert!(em.includes_type(MM, "Tree"));
        assert!(!em.includes_metamodel("http://example.org/other"));
        assert!(!em.includes_type("http://example.org/other", "Thing"));
    }

    #[test]
    fn test_type_exclusion_keeps_metamodel() {
        let em = EffectiveMetamodel {
            includes: vec![],
            excludes: vec![Rule::of_type(MM, "Scrap")],
        };
        assert!(em.includes_metamodel(MM));
        assert!(!em.includes_type(MM, "Scrap"));
        assert!(em.includes_type(MM, "Tree"));
        // The slot level inherits the type's wildcard exclusion.
        assert!(!em.includes_slot(MM, "Scrap", "anything"));
    }

    #[test]
    fn test_slot_exclusion_keeps_type() {
        let em = EffectiveMetamodel {
            includes: vec![],
            excludes: vec![Rule::of_slot(MM, "Tree", "notes")],
        };
        assert!(em.includes_type(MM, "Tree"));
        assert!(!em.includes_slot(MM, "Tree", "notes"));
        assert!(em.includes_slot(MM, "Tree", "children"));
    }

    #[test]
    fn test_slot_inclusion_implies_coarser_levels() {
        let em = EffectiveMetamodel {
            includes: vec![Rule::of_slot(MM, "Tree", "children")],
            excludes: vec![],
        };
        assert!(em.includes_metamodel(MM));
        assert!(em.includes_type(MM, "Tree"));
        assert!(em.includes_slot(MM, "Tree", "children"));
        assert!(!em.includes_slot(MM, "Tree", "label"));
        assert!(!em.includes_type(MM, "Other"));
    }

    #[test]
    fn test_exclusion_overrides_inclusion() {
        let em = EffectiveMetamodel {
            includes: vec![Rule::metamodel(MM)],
            excludes: vec![Rule::of_type(MM, "Tree")],
        };
        assert!(em.includes_metamodel(MM));
        assert!(!em.includes_type(MM, "Tree"));
    }
}
