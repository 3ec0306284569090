#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **causa-types** – Shared primitive data structures for the causa workflow engine.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It intentionally makes no assumptions about I/O, hashing algorithms, or
//! storage backends — those live in `causa-store-core` and `causa-graph`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Content hash
//─────────────────────────────

/// Length in bytes of a causa content hash (truncated BLAKE3 digest).
pub const HASH_LEN: usize = 20;

/// A content hash identifying a Funsie, Artifact, or Operation.
///
/// Hashes are derived from the canonical encoding of the entity they
/// identify, never from a random generator — two entities with identical
/// canonical bytes always collapse to the same hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CausaHash(pub [u8; HASH_LEN]);

impl CausaHash {
    /// Build a hash from raw bytes.
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Borrow the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lower-case hexadecimal representation.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for CausaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CausaHash({})", self.to_hex())
    }
}

impl fmt::Display for CausaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when a hex string cannot be parsed into a [`CausaHash`].
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    /// The string did not decode as hexadecimal.
    #[error("invalid hex digit in hash string")]
    InvalidHex,
    /// The decoded byte count did not match [`HASH_LEN`].
    #[error("expected {HASH_LEN} bytes, found {0}")]
    WrongLength(usize),
}

impl FromStr for CausaHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_LEN * 2 {
            return Err(HashParseError::WrongLength(s.len() / 2));
        }
        let mut bytes = [0u8; HASH_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = s.as_bytes()[i * 2];
            let lo = s.as_bytes()[i * 2 + 1];
            *byte = (hex_digit(hi)? << 4) | hex_digit(lo)?;
        }
        Ok(CausaHash(bytes))
    }
}

fn hex_digit(c: u8) -> Result<u8, HashParseError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HashParseError::InvalidHex),
    }
}

//─────────────────────────────
//  Encoding
//─────────────────────────────

/// How an artifact's byte content should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Opaque bytes — no further interpretation (files, stdout/stderr capture).
    RawBytes,
    /// A self-describing structured value (JSON/MessagePack) exchanged with callables.
    StructuredValue,
}

//─────────────────────────────
//  Funsie
//─────────────────────────────

/// A named input or output slot on a [`Funsie`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Slot name, unique within the funsie's input or output set.
    pub name: String,
    /// How bytes bound to this slot should be interpreted.
    pub encoding: Encoding,
    /// When `true`, an error on this input short-circuits the whole operation
    /// instead of being handed to the funsie body as an `Err` value.
    pub strict: bool,
}

impl Slot {
    /// Construct a strict slot with the given encoding.
    pub fn strict(name: impl Into<String>, encoding: Encoding) -> Self {
        Self { name: name.into(), encoding, strict: true }
    }

    /// Construct a non-strict slot with the given encoding.
    pub fn non_strict(name: impl Into<String>, encoding: Encoding) -> Self {
        Self { name: name.into(), encoding, strict: false }
    }
}

/// The executable kind of a [`Funsie`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunsieKind {
    /// A sequence of shell command lines, executed in order inside a scratch directory.
    Shell(Vec<String>),
    /// A named, registered callable.
    Callable {
        /// Stable registry name — participates in the funsie hash.
        name: String,
    },
    /// A named, registered sub-DAG generator.
    Subdag {
        /// Stable registry name of the generator — participates in the funsie hash.
        generator: String,
    },
    /// A leaf funsie with no inputs, whose sole output is supplied directly
    /// (constant data ingested into the graph).
    DataSource,
}

/// A pure, content-addressed description of an operation: its kind and the
/// shape of its inputs/outputs. A `Funsie` describes *what could be run*; an
/// [`Operation`] binds it to concrete artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funsie {
    /// What this funsie does when invoked.
    pub kind: FunsieKind,
    /// Named input slots, in declaration order.
    pub inputs: Vec<Slot>,
    /// Named output slots, in declaration order.
    pub outputs: Vec<Slot>,
    /// Opaque extra bytes (e.g. a wall-clock timeout), hashed along with the
    /// rest of the funsie so changing them changes identity.
    pub extra: Option<Vec<u8>>,
}

//─────────────────────────────
//  Artifact
//─────────────────────────────

/// Where an artifact's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parent {
    /// Supplied directly by a user (constant data), not produced by any operation.
    Const,
    /// Produced as the named output slot of an operation.
    Produced {
        /// The producing operation's hash.
        op: CausaHash,
    },
}

/// A named handle to a (possibly not-yet-computed) blob of bytes.
///
/// An artifact's hash is derived from its identity — `(op_hash, slot_name)`
/// for produced artifacts, or the content hash for constants — not from its
/// bytes, so a handle can exist and be referenced before the bytes themselves
/// are known ("a pointer to future data").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// This artifact's own content hash.
    pub hash: CausaHash,
    /// How to interpret this artifact's bytes once resolved.
    pub encoding: Encoding,
    /// Where this artifact's bytes originate.
    pub parent: Parent,
}

/// Current resolution state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactStatus {
    /// Bytes not yet available — the producing operation has not finished.
    Unresolved,
    /// Bytes are available and may be fetched.
    Ready,
    /// The producing operation failed; see the associated [`ErrorRecord`].
    Error,
    /// Deduplicated: this artifact's bytes are identical to another
    /// artifact's, so its content lives under that other hash.
    Linked(CausaHash),
}

//─────────────────────────────
//  Operation
//─────────────────────────────

/// A [`Funsie`] bound to concrete input and (once run) output artifacts.
///
/// An operation's hash is the causal hash of its funsie hash chained with
/// its sorted input bindings — identical operations always collapse to the
/// same hash, which is the basis for the engine's content-addressed caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Hash of the [`Funsie`] this operation invokes.
    pub funsie: CausaHash,
    /// Input slot name → bound artifact hash, in canonical (ascending) key order.
    pub input_bindings: BTreeMap<String, CausaHash>,
    /// Output slot name → produced artifact hash. Filled in before the
    /// operation is first enqueued, once the funsie's output slot set is known.
    pub output_bindings: BTreeMap<String, CausaHash>,
}

/// Lifecycle state of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Enqueued, not yet claimed by a worker.
    Pending,
    /// Claimed by a worker and currently executing.
    Running,
    /// Finished successfully; all outputs are `Ready` or `Linked`.
    Done,
    /// Finished with an error; see the associated [`ErrorRecord`].
    Error,
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// The family of failure an [`ErrorRecord`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A shell command or callable finished without producing a declared output.
    MissingOutput,
    /// A shell command exited with a non-zero status.
    NonzeroExit,
    /// The operation exceeded its configured wall-clock timeout.
    Timeout,
    /// A callable returned an application-level error value.
    CallableRaised,
    /// An artifact's bytes could not be decoded into the encoding its slot declares.
    DecodeError,
    /// A strict input artifact was itself in the `Error` state.
    Upstream,
    /// Two writers disagreed on the bytes for the same content-addressed key. Fatal.
    HashCollision,
    /// The KV store failed to service a read or write.
    StoreFailure,
    /// A sub-DAG generator returned a link table with the wrong arity.
    SubdagArity,
}

impl ErrorKind {
    /// Whether a worker may legitimately retry the operation that produced
    /// this error, versus surfacing it as permanent.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::StoreFailure)
    }
}

/// A recorded failure, attached to an operation or artifact in the `Error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The kind of failure.
    pub kind: ErrorKind,
    /// The operation that first produced this error (for `Upstream`, the
    /// original failing operation, not the one that merely propagated it).
    pub origin: CausaHash,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorRecord {
    /// Construct a new error record.
    pub fn new(kind: ErrorKind, origin: CausaHash, message: impl Into<String>) -> Self {
        Self { kind, origin, message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_roundtrip() {
        let h = CausaHash::new([7u8; HASH_LEN]);
        let hex = h.to_hex();
        let parsed: CausaHash = hex.parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn hash_parse_rejects_wrong_length() {
        let err = "abcd".parse::<CausaHash>().unwrap_err();
        assert!(matches!(err, HashParseError::WrongLength(_)));
    }

    #[test]
    fn hash_parse_rejects_bad_hex() {
        let bad = "zz".repeat(HASH_LEN);
        let err = bad.parse::<CausaHash>().unwrap_err();
        assert!(matches!(err, HashParseError::InvalidHex));
    }

    #[test]
    fn error_kind_transience() {
        assert!(ErrorKind::StoreFailure.is_transient());
        assert!(!ErrorKind::HashCollision.is_transient());
    }

    #[test]
    fn serde_roundtrip_funsie() {
        let f = Funsie {
            kind: FunsieKind::Shell(vec!["echo hi".into()]),
            inputs: vec![Slot::strict("in", Encoding::RawBytes)],
            outputs: vec![Slot::strict("out", Encoding::RawBytes)],
            extra: None,
        };
        let json = serde_json::to_string(&f).unwrap();
        let back: Funsie = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
