use sha2::{Digest, Sha256};

use crate::store::QuerySpec;

/// Deterministic identity of a live query: the SHA-256 of a canonical
/// encoding of collection, filters, ordering, limit and the caller's
/// dependency tuple. Equal signatures share one store subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct QuerySignature(String);

impl QuerySignature {
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Field and record separators keep adjacent variable-length parts from
// concatenating into the same byte stream ("ab"+"c" vs "a"+"bc").
const FS: &[u8] = &[0x1f];
const RS: &[u8] = &[0x1e];

/// Computes the signature for a query. Pure and total: every
/// `serde_json::Value` renders to text, so this never fails.
pub fn signature_for(query: &QuerySpec) -> QuerySignature {
    let mut hasher = Sha256::new();
    hasher.update(query.collection.as_bytes());
    hasher.update(RS);

    for filter in &query.filters {
        hasher.update(filter.field.as_bytes());
        hasher.update(FS);
        hasher.update(filter.op.token().as_bytes());
        hasher.update(FS);
        hasher.update(filter.value.to_string().as_bytes());
        hasher.update(RS);
    }
    hasher.update(RS);

    if let Some(order) = &query.order_by {
        hasher.update(order.field.as_bytes());
        hasher.update(FS);
        hasher.update(format!("{:?}", order.direction).as_bytes());
    }
    hasher.update(RS);

    if let Some(limit) = query.limit {
        hasher.update(limit.to_string().as_bytes());
    }
    hasher.update(RS);

    for dep in &query.deps {
        hasher.update(dep.as_bytes());
        hasher.update(FS);
    }

    QuerySignature(format!("{:x}", hasher.finalize()))
}
