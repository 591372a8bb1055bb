//! Domain-separated BLAKE3 hashing.
//!
//! ## Modes
//!
//! - [`hash`] - Pure hashing: oplog content addresses, Merkle leaves
//! - [`derive_key`] - Key derivation: addresses, node ids, raft ids, join keys
//! - [`keyed_hash`] - Keyed MAC/PRF
//!
//! Every derivation uses one of the context strings in [`contexts`].

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const KEY_ADDRESS: &str = "kith v1 key-address";
    pub const NODE_ID: &str = "kith v1 node-id";
    pub const RAFT_ID: &str = "kith v1 raft-id";
    pub const CHILD_KEY: &str = "kith v1 child-key";
    pub const JOIN_KEY_HASH: &str = "kith v1 join-key-hash";
    pub const JOIN_CIPHER_KEY: &str = "kith v1 join-cipher-key";
    pub const OPLOG_DIGEST: &str = "kith v1 oplog-digest";
    pub const MERKLE_NODE: &str = "kith v1 merkle-node";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        KEY_ADDRESS,
        NODE_ID,
        RAFT_ID,
        CHILD_KEY,
        JOIN_KEY_HASH,
        JOIN_CIPHER_KEY,
        OPLOG_DIGEST,
        MERKLE_NODE,
    ];
}

/// Compute BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// `context` must be one of the strings in [`contexts`].
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    let hash = hasher.finalize();
    out.copy_from_slice(hash.as_bytes());
    out
}

/// Compute a keyed BLAKE3 hash (MAC/PRF).
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Verify that a context string is registered.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

/// Encode multiple dynamic fields using length-prefixed encoding.
///
/// `LE32(len(field1)) || field1 || LE32(len(field2)) || field2 || ...`
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}

/// Hash a sequence of fields under a derivation context.
///
/// Used for oplog digests and Merkle node addresses where the input is a
/// list of variable-length parts.
pub fn derive_multi(context: &str, fields: &[&[u8]]) -> [u8; 32] {
    derive_key(context, &encode_multi_field(fields))
}
