//! Removal of files and elements, with inbound references parked as proxies.

use crate::derived::{EDGE_LABEL_DERIVED_TARGET, PROPERTY_DERIVED_FLAG};
use crate::events::ChangeEvent;
use crate::graph::{NodeId, PropertyValue};

use super::error::SyncError;
use super::inserter::{add_proxy_references, FileContext, FileStats};
use super::{
    EDGE_LABEL_FILE, IDENTIFIER_PROPERTY, INDEX_FILES, INDEX_ROOTS, PROPERTY_CONTAINER,
    PROPERTY_CONTAINMENT, TRANSIENT_EDGE_LABELS,
};

/// Removes a whole file: every element it holds, then the file node itself.
pub(crate) fn delete_file(ctx: &FileContext<'_>, stats: &mut FileStats) -> Result<(), SyncError> {
    let elements: Vec<_> = ctx
        .backend
        .incoming(ctx.file_node, Some(EDGE_LABEL_FILE))?
        .iter()
        .map(|edge| edge.from)
        .collect();
    for element in elements {
        detach_element(ctx, element, true, stats)?;
    }
    ctx.backend.index_remove_node(INDEX_FILES, ctx.file_node)?;
    ctx.backend.delete_node(ctx.file_node)?;
    ctx.bus.emit(&ChangeEvent::FileRemoved {
        repository: ctx.repository.to_string(),
        path: ctx.path.to_string(),
    });
    Ok(())
}

/// Detaches one element from the context's file. A fragment-unique singleton
/// still claimed by other files only loses this file's edge and returns
/// `false`; otherwise the element, its derived values and its index entries
/// go, and surviving inbound references become proxy slots on their holders.
pub(crate) fn detach_element(
    ctx: &FileContext<'_>,
    element: NodeId,
    whole_file: bool,
    stats: &mut FileStats,
) -> Result<bool, SyncError> {
    let uri = ctx.file_uri();
    let fragment = match ctx.backend.node_property(element, IDENTIFIER_PROPERTY)? {
        Some(PropertyValue::Str(fragment)) => fragment,
        _ => String::new(),
    };

    let file_edges = ctx.backend.outgoing(element, Some(EDGE_LABEL_FILE))?;
    if file_edges.len() > 1 {
        for edge in &file_edges {
            if edge.to == ctx.file_node {
                ctx.backend.delete_relationship(edge.id)?;
            }
        }
        ctx.backend
            .index_remove(INDEX_ROOTS, &uri, &fragment, element)?;
        return Ok(false);
    }

    ctx.bus.emit(&ChangeEvent::ElementRemoved {
        element,
        transient: ctx.transient,
    });

    for edge in ctx.backend.outgoing(element, None)? {
        if ctx
            .backend
            .edge_property(edge.id, PROPERTY_DERIVED_FLAG)?
            .is_some()
        {
            // The derived value node dies with its owner.
            let derived = edge.to;
            ctx.backend.delete_relationship(edge.id)?;
            for target_edge in ctx.backend.outgoing(derived, None)? {
                ctx.backend.delete_relationship(target_edge.id)?;
            }
            for name in ctx.backend.index_names() {
                ctx.backend.index_remove_node(&name, derived)?;
            }
            ctx.backend.delete_node(derived)?;
            continue;
        }
        ctx.backend.delete_relationship(edge.id)?;
        if !TRANSIENT_EDGE_LABELS.contains(&edge.label.as_str()) {
            ctx.bus.emit(&ChangeEvent::ReferenceRemoved {
                source: element,
                target: edge.to,
                label: edge.label,
                transient: ctx.transient,
            });
        }
    }

    for edge in ctx.backend.incoming(element, None)? {
        if edge.label == EDGE_LABEL_DERIVED_TARGET {
            // Stale access entries point the recompute at the holder.
            ctx.backend.delete_relationship(edge.id)?;
            continue;
        }
        let containment = ctx
            .backend
            .edge_property(edge.id, PROPERTY_CONTAINMENT)?
            .is_some();
        let container = ctx
            .backend
            .edge_property(edge.id, PROPERTY_CONTAINER)?
            .is_some();
        // When the whole file goes, holders living only in it go too; no
        // point parking proxies on them.
        let source_dies = whole_file && {
            let holder_files = ctx.backend.outgoing(edge.from, Some(EDGE_LABEL_FILE))?;
            !holder_files.is_empty() && holder_files.iter().all(|e| e.to == ctx.file_node)
        };
        ctx.backend.delete_relationship(edge.id)?;
        if !source_dies {
            ctx.bus.emit(&ChangeEvent::ReferenceRemoved {
                source: edge.from,
                target: element,
                label: edge.label.clone(),
                transient: ctx.transient,
            });
            add_proxy_references(
                ctx.backend,
                edge.from,
                &uri,
                &[(fragment.clone(), edge.label, containment, container)],
            )?;
        }
    }

    for name in ctx.backend.index_names() {
        ctx.backend.index_remove_node(&name, element)?;
    }
    ctx.backend.delete_node(element)?;
    stats.elements_removed += 1;
    Ok(true)
}
