//! Thin layer over the `yrs` CRDT engine.
//!
//! Everything here uses the v1 update encoding. Updates are commutative:
//! applying a set of them in any order converges on the same state.

use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, Origin, ReadTxn, StateVector, Transact, Update};

/// Identity of an [`UpdateProvider`](crate::provider::UpdateProvider).
pub type ProviderId = Uuid;

/// CRDT engine errors.
#[derive(Debug, Clone, Error)]
pub enum CrdtError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to decode state vector: {0}")]
    StateVector(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to merge updates: {0}")]
    Merge(String),
}

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Authored against this replica (editor input, snapshots).
    Local,
    /// Applied by the provider from the update log; never re-persisted.
    Remote(ProviderId),
}

impl UpdateOrigin {
    /// Classify a transaction origin against one provider's tag.
    pub fn classify(origin: Option<&Origin>, provider: ProviderId, tag: &Origin) -> Self {
        match origin {
            Some(origin) if origin == tag => UpdateOrigin::Remote(provider),
            _ => UpdateOrigin::Local,
        }
    }
}

/// Transaction origin tag used by one provider.
pub fn provider_origin(provider: ProviderId) -> Origin {
    let tag = format!("folio-provider:{provider}");
    Origin::from(tag.as_str())
}

/// Fresh document with garbage collection of deleted content enabled.
pub fn gc_document() -> Doc {
    Doc::with_options(Options {
        skip_gc: false,
        ..Options::default()
    })
}

/// Apply one encoded update, optionally tagging the transaction origin.
pub fn apply_update(doc: &Doc, update: &[u8], origin: Option<Origin>) -> Result<(), CrdtError> {
    let update = Update::decode_v1(update).map_err(|e| CrdtError::Decode(e.to_string()))?;
    let mut txn = match origin {
        Some(origin) => doc.transact_mut_with(origin),
        None => doc.transact_mut(),
    };
    txn.apply_update(update)
        .map_err(|e| CrdtError::Apply(e.to_string()))
}

/// Encode the document state, or only what `state_vector` has not seen.
pub fn encode_state_as_update(doc: &Doc, state_vector: Option<&[u8]>) -> Result<Vec<u8>, CrdtError> {
    let sv = match state_vector {
        Some(bytes) => {
            StateVector::decode_v1(bytes).map_err(|e| CrdtError::StateVector(e.to_string()))?
        }
        None => StateVector::default(),
    };
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&sv))
}

/// Encode the document's state vector.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Merge several updates into one. A single update passes through untouched.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, CrdtError> {
    match updates {
        [] => Ok(Vec::new()),
        [single] => Ok(single.clone()),
        many => {
            let refs: Vec<&[u8]> = many.iter().map(Vec::as_slice).collect();
            yrs::merge_updates_v1(&refs).map_err(|e| CrdtError::Merge(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{append_text, read_text};

    #[test]
    fn test_origin_classification() {
        let id = Uuid::new_v4();
        let tag = provider_origin(id);
        assert_eq!(UpdateOrigin::classify(Some(&tag), id, &tag), UpdateOrigin::Remote(id));
        assert_eq!(UpdateOrigin::classify(None, id, &tag), UpdateOrigin::Local);

        let other = provider_origin(Uuid::new_v4());
        assert_eq!(UpdateOrigin::classify(Some(&other), id, &tag), UpdateOrigin::Local);
    }

    #[test]
    fn test_state_roundtrip() {
        let doc = Doc::new();
        append_text(&doc, "hello");
        let update = encode_state_as_update(&doc, None).unwrap();

        let copy = Doc::new();
        apply_update(&copy, &update, None).unwrap();
        assert_eq!(read_text(&copy), "hello");
    }

    #[test]
    fn test_incremental_update_from_state_vector() {
        let doc = Doc::new();
        append_text(&doc, "base");
        let sv = encode_state_vector(&doc);
        let base = encode_state_as_update(&doc, None).unwrap();
        append_text(&doc, " more");
        let delta = encode_state_as_update(&doc, Some(&sv)).unwrap();

        let copy = Doc::new();
        apply_update(&copy, &base, None).unwrap();
        apply_update(&copy, &delta, None).unwrap();
        assert_eq!(read_text(&copy), "base more");
    }

    #[test]
    fn test_commutative_application() {
        let doc = Doc::new();
        let mut updates = Vec::new();
        for word in ["a", "b", "c", "d"] {
            let sv = encode_state_vector(&doc);
            append_text(&doc, word);
            updates.push(encode_state_as_update(&doc, Some(&sv)).unwrap());
        }

        let forward = Doc::new();
        for u in &updates {
            apply_update(&forward, u, None).unwrap();
        }
        let backward = Doc::new();
        for u in updates.iter().rev() {
            apply_update(&backward, u, None).unwrap();
        }

        assert_eq!(read_text(&forward), "abcd");
        assert_eq!(read_text(&backward), "abcd");
        assert_eq!(
            encode_state_as_update(&forward, None).unwrap(),
            encode_state_as_update(&backward, None).unwrap()
        );
    }

    #[test]
    fn test_merge_updates() {
        let doc = Doc::new();
        let mut updates = Vec::new();
        for word in ["x", "y", "z"] {
            let sv = encode_state_vector(&doc);
            append_text(&doc, word);
            updates.push(encode_state_as_update(&doc, Some(&sv)).unwrap());
        }
        assert_eq!(merge_updates(&updates[..1]).unwrap(), updates[0]);

        let merged = merge_updates(&updates).unwrap();
        let copy = Doc::new();
        apply_update(&copy, &merged, None).unwrap();
        assert_eq!(read_text(&copy), "xyz");
    }

    #[test]
    fn test_decode_errors() {
        let doc = Doc::new();
        assert!(matches!(
            apply_update(&doc, &[0xff, 0xff, 0xff], None),
            Err(CrdtError::Decode(_)) | Err(CrdtError::Apply(_))
        ));
        assert!(encode_state_as_update(&doc, Some(&[0xff, 0xff, 0xff])).is_err());
    }
}
