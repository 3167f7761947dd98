//! Stored encoding. The resource version lives in the backend, never in the
//! stored bytes: it is cleared on encode and filled from `mod_revision` on
//! decode.

use keel_core::{Object, Spec, TypeMeta};
use keel_kv::{KeyValue, Revision};

use crate::error::StoreError;

pub(crate) fn encode<S: Spec>(obj: &mut Object<S>) -> Result<Vec<u8>, StoreError> {
    obj.metadata.resource_version.clear();
    serde_json::to_vec(obj).map_err(|e| StoreError::Internal(format!("encode {}: {e}", S::KIND)))
}

pub(crate) fn decode<S: Spec>(kv: &KeyValue) -> Result<Object<S>, StoreError> {
    decode_at(&kv.value, &kv.key, kv.mod_revision)
}

/// Decodes `bytes` and stamps it with `revision`; used for deletes, whose
/// event carries the last value at the delete revision.
pub(crate) fn decode_at<S: Spec>(bytes: &[u8], key: &str, revision: Revision) -> Result<Object<S>, StoreError> {
    let mut obj: Object<S> = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Internal(format!("decode {key}: {e}")))?;
    if obj.type_meta.kind.is_empty() {
        obj.type_meta = TypeMeta::new(S::KIND.as_str());
    }
    obj.metadata.resource_version = revision.to_string();
    Ok(obj)
}

/// Parses a client-supplied resource version. Empty means "unspecified".
pub(crate) fn parse_version(rv: &str) -> Result<Option<Revision>, String> {
    if rv.is_empty() {
        return Ok(None);
    }
    rv.parse::<Revision>().map(Some).map_err(|_| format!("resource version {rv:?} is not a valid revision"))
}
