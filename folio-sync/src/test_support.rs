//! Helpers shared by unit tests.

use yrs::{Doc, GetString, Text, Transact};

pub const TEXT_ROOT: &str = "content";

/// Append `value` to the document's text root in its own transaction.
pub fn append_text(doc: &Doc, value: &str) {
    let text = doc.get_or_insert_text(TEXT_ROOT);
    let mut txn = doc.transact_mut();
    let len = text.len(&txn);
    text.insert(&mut txn, len, value);
}

/// Current contents of the document's text root.
pub fn read_text(doc: &Doc) -> String {
    let text = doc.get_or_insert_text(TEXT_ROOT);
    let txn = doc.transact();
    text.get_string(&txn)
}
