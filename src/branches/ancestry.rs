//! Common ancestor resolution between two lineages.

use crate::error::Result;
use crate::refs::Ref;
use crate::types::NodeId;

/// Nearest base ref shared by the lineages of `source` and `target`.
///
/// `source_path` / `target_path` are the base refs leading from main to the
/// nodes of `source` / `target`. Candidates are the source ref itself, then
/// its base refs from nearest to farthest; the first one owned by a node on
/// the target's lineage (the target node included) wins. When the target
/// reaches that node at a lower version, the candidate is capped to it.
///
/// Falls back to the first entry of the source path (main), or to `source`
/// itself when the source is main.
pub(crate) fn common_ancestor(
    source: &Ref,
    source_path: &[Ref],
    target: &Ref,
    target_path: &[Ref],
) -> Result<Ref> {
    let target_node = target.node_id()?;

    let candidates = std::iter::once(source).chain(source_path.iter().rev());
    for candidate in candidates {
        let owner = candidate.node_id()?;
        if owner == target_node {
            return Ok(cap(candidate, target.version()));
        }
        if let Some(on_target) = find_owned_by(target_path, owner)? {
            return Ok(cap(candidate, on_target.version()));
        }
    }

    Ok(source_path.first().unwrap_or(source).clone())
}

fn find_owned_by(path: &[Ref], node_id: NodeId) -> Result<Option<&Ref>> {
    for base_ref in path.iter().rev() {
        if base_ref.node_id()? == node_id {
            return Ok(Some(base_ref));
        }
    }
    Ok(None)
}

fn cap(candidate: &Ref, bound: Option<u64>) -> Ref {
    match (candidate.version(), bound) {
        (Some(version), Some(bound)) if bound < version => candidate.at_version(bound),
        _ => candidate.clone(),
    }
}
