use crate::model::{GraphScope, NodeId, NodeKind};
use blake3::Hasher;

/// Compute the deterministic id of a graph node.
///
/// The id is derived from:
/// - `scope`: repository key and revision, so every repository and commit has
///   a disjoint id space
/// - `file_path`: repository-relative path (empty for the Repository node)
/// - `qualname`: the qualified symbol name within the file
/// - `kind`: disambiguates e.g. a module and a type with the same name
///
/// Line numbers are NOT included. Re-ingesting the same revision yields the same
/// ids, which is what makes batch replay idempotent.
///
/// # Format
///
/// `n_{16_hex_chars}`: the first 64 bits of the blake3 hash.
pub fn node_id(scope: &GraphScope, file_path: &str, qualname: &str, kind: NodeKind) -> NodeId {
    let mut hasher = Hasher::new();
    hasher.update(scope.repository.as_bytes());
    hasher.update(b"\x00");
    hasher.update(scope.revision.as_bytes());
    hasher.update(b"\x00");
    hasher.update(file_path.as_bytes());
    hasher.update(b"\x00");
    hasher.update(qualname.as_bytes());
    hasher.update(b"\x00");
    hasher.update(kind.as_str().as_bytes());

    let hash = hasher.finalize();
    NodeId(format!("n_{}", &hash.to_hex()[..16]))
}

pub fn repository_node_id(scope: &GraphScope) -> NodeId {
    node_id(scope, "", &scope.repository, NodeKind::Repository)
}

pub fn file_node_id(scope: &GraphScope, rel_path: &str) -> NodeId {
    node_id(scope, rel_path, rel_path, NodeKind::File)
}
