//! KV key-namespace constants and formatters for the storage schema.
//!
//! Every key is derived deterministically from a hash (and, for the
//! artifact/operation namespaces, a sub-key), so two processes writing the
//! "same" record always target the same keys.

use causa_types::CausaHash;

/// Namespace prefix for funsie records (`funsie:{hash}`).
pub const FUNSIE_PREFIX: &str = "funsie:";
/// Namespace prefix for operation records (`op:{hash}`).
pub const OP_PREFIX: &str = "op:";
/// Namespace prefix for artifact metadata (`art:{hash}`).
pub const ART_PREFIX: &str = "art:";
/// Key holding the store's schema version tag.
pub const META_VERSION_KEY: &str = "meta:version";

/// `funsie:{hash}` — the funsie record.
pub fn funsie_key(hash: CausaHash) -> String {
    format!("{FUNSIE_PREFIX}{hash}")
}

/// `op:{hash}` — the operation record (funsie hash + input/output bindings).
pub fn op_key(hash: CausaHash) -> String {
    format!("{OP_PREFIX}{hash}")
}

/// `op:status:{hash}` — the operation's lifecycle status.
pub fn op_status_key(hash: CausaHash) -> String {
    format!("{OP_PREFIX}status:{hash}")
}

/// `op:deps:{hash}` — the set of artifact hashes this operation consumes.
pub fn op_deps_key(hash: CausaHash) -> String {
    format!("{OP_PREFIX}deps:{hash}")
}

/// `op:subdag:{hash}` — the set of generated operation hashes, only present
/// for subdag operations that have already run.
pub fn op_subdag_key(hash: CausaHash) -> String {
    format!("{OP_PREFIX}subdag:{hash}")
}

/// `op:lease:{hash}` — the worker id currently holding this operation's
/// claim lease, used by the reclaim pass to attribute stale claims.
pub fn op_lease_key(hash: CausaHash) -> String {
    format!("{OP_PREFIX}lease:{hash}")
}

/// `art:{hash}` — artifact metadata (encoding, parent).
pub fn art_key(hash: CausaHash) -> String {
    format!("{ART_PREFIX}{hash}")
}

/// `art:data:{hash}` — artifact bytes, present only when status is `Ready`.
pub fn art_data_key(hash: CausaHash) -> String {
    format!("{ART_PREFIX}data:{hash}")
}

/// `art:status:{hash}` — the artifact's current `ArtifactStatus`.
pub fn art_status_key(hash: CausaHash) -> String {
    format!("{ART_PREFIX}status:{hash}")
}

/// `art:err:{hash}` — the artifact's `ErrorRecord`, present only when status
/// is `Error`.
pub fn art_err_key(hash: CausaHash) -> String {
    format!("{ART_PREFIX}err:{hash}")
}

/// `art:prod:{hash}` — the hex hash of the operation that produces this
/// artifact, or the literal `const` tag for user-supplied constants.
pub fn art_prod_key(hash: CausaHash) -> String {
    format!("{ART_PREFIX}prod:{hash}")
}

/// `art:consumers:{hash}` — the set of operation hashes bound to this
/// artifact as an input. Lets a worker that just produced an artifact
/// discover and enqueue its ready dependents directly, without a central
/// scheduler walking the whole graph.
pub fn art_consumers_key(hash: CausaHash) -> String {
    format!("{ART_PREFIX}consumers:{hash}")
}
