use crate::error::{self, Result};
use olpc_cjson::CanonicalFormatter;
use serde::Serialize;
use snafu::ResultExt;

/// Serializes `value` to OLPC canonical JSON, the byte-stable form that signatures, key IDs and
/// metadata hashes are computed over.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
    value
        .serialize(&mut ser)
        .context(error::JsonSerializationSnafu { what })?;
    Ok(buf)
}
