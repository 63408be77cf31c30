//! Content-signature diff between a parsed file and its indexed state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::graph::NodeId;
use crate::model::{IdentityKey, ModelElement};

/// Outcome of diffing one file. `added`, `changed` and `unchanged` hold
/// indexes into the parsed element list; `removed` holds the indexed
/// elements no longer present, in identity order.
#[derive(Debug, Default)]
pub(crate) struct DiffResult {
    pub added: Vec<usize>,
    pub changed: Vec<(usize, NodeId)>,
    pub unchanged: Vec<(usize, NodeId)>,
    pub removed: Vec<(IdentityKey, NodeId)>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Matches parsed elements against the indexed `(node, signature)` map by
/// identity key. Equal signatures leave an element untouched.
pub(crate) fn diff_file(
    elements: &[Arc<dyn ModelElement>],
    existing: &HashMap<IdentityKey, (NodeId, String)>,
    path: &str,
) -> DiffResult {
    let mut result = DiffResult::default();
    let mut seen: HashSet<IdentityKey> = HashSet::with_capacity(elements.len());

    for (index, element) in elements.iter().enumerate() {
        let key = IdentityKey::of(element.as_ref(), path);
        match existing.get(&key) {
            Some((node, signature)) if *signature == element.signature() => {
                result.unchanged.push((index, *node));
            }
            Some((node, _)) => result.changed.push((index, *node)),
            None => result.added.push(index),
        }
        seen.insert(key);
    }

    result.removed = existing
        .iter()
        .filter(|(key, _)| !seen.contains(key))
        .map(|(key, (node, _))| (key.clone(), *node))
        .collect();
    result.removed.sort();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::json::JsonElement;

    const MM: &str = "http://example.org/tree";

    fn element(fragment: &str, label: &str) -> Arc<dyn ModelElement> {
        Arc::new(JsonElement::for_tests(
            fragment,
            MM,
            "Tree",
            &[("label", label.into())],
            &[],
        ))
    }

    fn indexed(
        entries: &[(&Arc<dyn ModelElement>, NodeId)],
        path: &str,
    ) -> HashMap<IdentityKey, (NodeId, String)> {
        entries
            .iter()
            .map(|(element, node)| {
                (
                    IdentityKey::of(element.as_ref(), path),
                    (*node, element.signature()),
                )
            })
            .collect()
    }

    #[test]
    fn test_identical_content_is_unchanged() {
        let elements = vec![element("a", "one"), element("b", "two")];
        let existing = indexed(&[(&elements[0], 10), (&elements[1], 11)], "m.model.json");

        let diff = diff_file(&elements, &existing, "m.model.json");
        assert!(diff.is_empty());
        assert_eq!(diff.unchanged, vec![(0, 10), (1, 11)]);
    }

    #[test]
    fn test_added_changed_removed_partition() {
        let old_b = element("b", "two");
        let old_c = element("c", "three");
        let existing = indexed(&[(&old_b, 11), (&old_c, 12)], "m.model.json");

        // b changed its label, c disappeared, d is new.
        let elements = vec![element("b", "two!"), element("d", "four")];
        let diff = diff_file(&elements, &existing, "m.model.json");

        assert_eq!(diff.added, vec![1]);
        assert_eq!(diff.changed, vec![(0, 11)]);
        assert!(diff.unchanged.is_empty());
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].1, 12);
    }

    #[test]
    fn test_same_fragment_in_another_file_is_a_different_identity() {
        let a = element("a", "one");
        let existing = indexed(&[(&a, 10)], "other.model.json");

        let elements = vec![element("a", "one")];
        let diff = diff_file(&elements, &existing, "m.model.json");

        // Scoped identity differs by path even for identical content.
        assert_eq!(diff.added, vec![0]);
        assert_eq!(diff.removed.len(), 1);
    }
}
