//! JSON exchange layer: import/export of whole revisions (`spec.md` §6.3,
//! `SPEC_FULL.md` §4.7). Built on `serde`/`serde_json`, decoupled from the
//! in-memory HAMT types, mirroring the original's `exchange/import_*.hpp`
//! family of dedicated translation units.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;
use crate::hamt::{HamtIndex, Reader};
use crate::transaction::Transaction;

/// Exchange document version written by this crate's exporter.
pub const CURRENT_EXCHANGE_VERSION: u32 = 1;

const ROOT_KEYS: &[&str] = &["version", "id", "transactions"];
const TRANSACTION_KEYS: &[&str] = &["names", "paths", "debugline", "fragments", "compilations"];

/// One transaction's worth of exported tables (`spec.md` §6.3). This crate
/// exposes a single primary HAMT rather than the original's family of
/// per-kind indices, so every entry round-trips through `fragments`,
/// hex-keyed (HAMT keys are arbitrary bytes, not necessarily UTF-8) with a
/// base64-encoded value; `names`, `paths`, `debugline`, and `compilations`
/// are carried for shape-fidelity and are empty unless a caller populates
/// them directly on a [`TransactionExport`] before export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionExport {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub debugline: BTreeMap<String, String>,
    #[serde(default)]
    pub fragments: BTreeMap<String, String>,
    #[serde(default)]
    pub compilations: BTreeMap<String, String>,
}

/// A complete exported revision (`spec.md` §6.3):
/// `{ version, id, transactions: [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionExport {
    pub version: u32,
    pub id: String,
    pub transactions: Vec<TransactionExport>,
}

/// Exports every `(key, value)` pair reachable from `index` as of whatever
/// revision `r` resolves against, as a single-transaction [`RevisionExport`].
pub fn export_revision<R: Reader>(db_uuid: Uuid, r: &R, index: &HamtIndex) -> Result<RevisionExport, Error> {
    let mut fragments = BTreeMap::new();
    for (key, value) in index.iter(r)? {
        fragments.insert(hex_encode(&key), STANDARD.encode(value));
    }
    Ok(RevisionExport {
        version: CURRENT_EXCHANGE_VERSION,
        id: db_uuid.to_string(),
        transactions: vec![TransactionExport { fragments, ..Default::default() }],
    })
}

/// Serializes a [`RevisionExport`] to a pretty-printed JSON string.
pub fn to_json(export: &RevisionExport) -> Result<String, Error> {
    Ok(serde_json::to_string_pretty(export)?)
}

/// Parses and validates a raw exchange document, then re-issues every
/// `fragments` entry as an `insert_or_assign` inside `txn`/`index`. The
/// caller is responsible for flushing `index` and committing `txn`
/// afterwards (`spec.md` §6.3: "re-issues allocations in a single
/// transaction per element and commits"). Returns the number of entries
/// imported.
///
/// Unknown top-level or per-transaction keys fail with
/// [`Error::UnknownTransactionObjectKey`]; a malformed `id` fails with
/// [`Error::BadUuid`]; a document missing required fields fails with
/// [`Error::RootObjectWasIncomplete`].
pub fn import_revision(txn: &mut Transaction, index: &mut HamtIndex, json: &str) -> Result<u64, Error> {
    let doc: Value = serde_json::from_str(json)?;
    let obj = doc.as_object().ok_or(Error::RootObjectWasIncomplete)?;
    for key in obj.keys() {
        if !ROOT_KEYS.contains(&key.as_str()) {
            return Err(Error::UnknownTransactionObjectKey(key.clone()));
        }
    }
    let _version = obj
        .get("version")
        .and_then(Value::as_u64)
        .ok_or(Error::RootObjectWasIncomplete)?;
    let id_str = obj
        .get("id")
        .and_then(Value::as_str)
        .ok_or(Error::RootObjectWasIncomplete)?;
    Uuid::parse_str(id_str).map_err(|_| Error::BadUuid(id_str.to_string()))?;
    let transactions = obj
        .get("transactions")
        .and_then(Value::as_array)
        .ok_or(Error::RootObjectWasIncomplete)?;

    let mut imported = 0u64;
    for tx in transactions {
        let tx_obj = tx.as_object().ok_or(Error::RootObjectWasIncomplete)?;
        for key in tx_obj.keys() {
            if !TRANSACTION_KEYS.contains(&key.as_str()) {
                return Err(Error::UnknownTransactionObjectKey(key.clone()));
            }
        }
        if let Some(fragments) = tx_obj.get("fragments").and_then(Value::as_object) {
            for (key_hex, value_b64) in fragments {
                let key = hex_decode(key_hex)
                    .map_err(|reason| Error::ExchangeCorrupt(format!("bad fragment key '{key_hex}': {reason}")))?;
                let value_str = value_b64
                    .as_str()
                    .ok_or_else(|| Error::ExchangeCorrupt("fragment value was not a string".to_string()))?;
                let value = STANDARD
                    .decode(value_str)
                    .map_err(|e| Error::ExchangeCorrupt(format!("bad fragment value: {e}")))?;
                index.insert_or_assign(txn, &key, &value)?;
                imported += 1;
            }
        }
        // `names`/`paths`/`debugline`/`compilations` have no counterpart to
        // replay against a single primary index in this crate's scope; they
        // round-trip through export but are otherwise inert on import.
    }
    Ok(imported)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd-length hex string".to_string());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::OpenOptions;

    #[test]
    fn export_then_import_round_trips() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let uuid = db.uuid();
        let mut index = HamtIndex::new_empty(db.current_revision());
        {
            let mut txn = db.begin().unwrap();
            index.insert(&mut txn, b"alpha", b"1").unwrap();
            index.insert(&mut txn, b"beta", b"2").unwrap();
            index.flush(&mut txn).unwrap();
            txn.commit().unwrap();
        }

        let export = export_revision(uuid, &db, &index).unwrap();
        assert_eq!(export.transactions[0].fragments.len(), 2);
        let json = to_json(&export).unwrap();

        let mut fresh_db = OpenOptions::new().open_anon().unwrap();
        let mut fresh_index = HamtIndex::new_empty(fresh_db.current_revision());
        {
            let mut txn = fresh_db.begin().unwrap();
            let n = import_revision(&mut txn, &mut fresh_index, &json).unwrap();
            assert_eq!(n, 2);
            fresh_index.flush(&mut txn).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(fresh_index.find(&fresh_db, b"alpha").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(fresh_index.find(&fresh_db, b"beta").unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn unknown_root_key_is_rejected() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        let json = r#"{"version":1,"id":"00000000-0000-0000-0000-000000000000","transactions":[],"bogus":1}"#;
        let err = import_revision(&mut txn, &mut index, json).unwrap_err();
        assert!(matches!(err, Error::UnknownTransactionObjectKey(k) if k == "bogus"));
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        let json = r#"{"version":1,"id":"not-a-uuid","transactions":[]}"#;
        let err = import_revision(&mut txn, &mut index, json).unwrap_err();
        assert!(matches!(err, Error::BadUuid(_)));
    }

    #[test]
    fn incomplete_root_object_is_rejected() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        let json = r#"{"version":1}"#;
        let err = import_revision(&mut txn, &mut index, json).unwrap_err();
        assert!(matches!(err, Error::RootObjectWasIncomplete));
    }

    #[test]
    fn unknown_transaction_key_is_rejected() {
        let mut db = OpenOptions::new().open_anon().unwrap();
        let mut index = HamtIndex::new_empty(db.current_revision());
        let mut txn = db.begin().unwrap();
        let json = r#"{"version":1,"id":"00000000-0000-0000-0000-000000000000","transactions":[{"nonsense":true}]}"#;
        let err = import_revision(&mut txn, &mut index, json).unwrap_err();
        assert!(matches!(err, Error::UnknownTransactionObjectKey(k) if k == "nonsense"));
    }
}
