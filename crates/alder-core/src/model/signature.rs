//! Content signatures over the reflection capability.

use sha2::{Digest, Sha256};

use super::ModelElement;

/// Hashes everything identity-relevant about an element: fragment, flags,
/// qualified type, attribute slots in name order, reference slots in name
/// order with targets in declared order. Field separators keep adjacent
/// values from colliding.
pub fn signature_of(element: &dyn ModelElement) -> String {
    let mut hasher = Sha256::new();

    hasher.update(element.uri_fragment().as_bytes());
    hasher.update([0u8, u8::from(element.is_fragment_unique()), u8::from(element.is_root())]);
    hasher.update(element.type_ref().to_string().as_bytes());
    hasher.update([0u8]);

    let mut attributes = element.attribute_names();
    attributes.sort();
    for name in attributes {
        if let Some(value) = element.attribute(&name) {
            hasher.update(name.as_bytes());
            hasher.update([1u8]);
            hasher.update(value.canonical().as_bytes());
            hasher.update([0u8]);
        }
    }

    let mut references = element.reference_names();
    references.sort();
    for name in references {
        if let Some(targets) = element.reference(&name, false) {
            hasher.update(name.as_bytes());
            hasher.update([2u8]);
            for target in targets {
                hasher.update(target.to_string().as_bytes());
                hasher.update([0u8]);
            }
        }
    }

    hex::encode(hasher.finalize())
}
