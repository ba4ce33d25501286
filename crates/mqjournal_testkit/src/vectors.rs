//! On-disk format test vectors.
//!
//! Each vector pins the exact bytes of a record frame or file header, so
//! an accidental format change fails loudly. The vectors can be exported
//! as JSON for other readers of the format.

use mqjournal_core::{FileId, JournalRecord};
use serde::{Deserialize, Serialize};

/// A format test vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVector {
    /// Unique identifier for this vector.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Expected encoding (hex).
    pub expected_hex: String,
}

impl TestVector {
    fn new(id: &str, description: &str, expected_hex: &str) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            expected_hex: expected_hex.into(),
        }
    }
}

/// Record frames paired with the record that encodes to them.
pub fn record_vectors() -> Vec<(TestVector, JournalRecord)> {
    vec![
        (
            TestVector::new(
                "add",
                "ADD of id 1, user type 7, payload \"hello\"",
                "0b0100000000000000050000000768656c6c6fc54eb394",
            ),
            JournalRecord::Add {
                id: 1u64.into(),
                user_type: 7,
                payload: b"hello".to_vec(),
            },
        ),
        (
            TestVector::new(
                "delete",
                "DELETE of id 1",
                "10010000000000000000000000002e9c9f6a",
            ),
            JournalRecord::Delete { id: 1u64.into() },
        ),
        (
            TestVector::new(
                "add_tx",
                "ADD_TX of id 2 in transaction 9",
                "0d0200000000000000020000000309000000000000006162c7785266",
            ),
            JournalRecord::AddTx {
                tx_id: 9u64.into(),
                id: 2u64.into(),
                user_type: 3,
                payload: b"ab".to_vec(),
            },
        ),
        (
            TestVector::new(
                "prepare",
                "PREPARE of transaction 9 with one record and extra data \"xid\"",
                "1100000000000000000300000000090000000000000001000000786964518c3535",
            ),
            JournalRecord::Prepare {
                tx_id: 9u64.into(),
                record_count: 1,
                extra_data: b"xid".to_vec(),
            },
        ),
        (
            TestVector::new(
                "commit",
                "COMMIT of transaction 9 with one record",
                "1200000000000000000000000000090000000000000001000000d1f3e135",
            ),
            JournalRecord::Commit {
                tx_id: 9u64.into(),
                record_count: 1,
            },
        ),
        (
            TestVector::new(
                "rollback",
                "ROLLBACK of transaction 9",
                "13000000000000000000000000000900000000000000ca4de927",
            ),
            JournalRecord::Rollback { tx_id: 9u64.into() },
        ),
    ]
}

/// Header of the data file with id 3.
pub fn header_vector() -> (TestVector, FileId) {
    (
        TestVector::new(
            "header",
            "header of data file 3",
            "4d514a46010000000300000000000000bce82167000000000000000000000000",
        ),
        FileId::new(3),
    )
}

/// Generate all test vectors as JSON.
pub fn all_vectors_json() -> String {
    let vectors = AllTestVectors {
        records: record_vectors().into_iter().map(|(v, _)| v).collect(),
        header: header_vector().0,
    };

    serde_json::to_string_pretty(&vectors).expect("Failed to serialize vectors")
}

#[derive(Debug, Serialize, Deserialize)]
struct AllTestVectors {
    records: Vec<TestVector>,
    header: TestVector,
}

/// Encodes bytes as lowercase hex.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decodes lowercase or uppercase hex.
///
/// # Panics
///
/// Panics on odd length or non-hex characters.
pub fn hex_decode(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "odd hex length");
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("invalid hex"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqjournal_core::{decode_header, encode_header, Decoded, HeaderKind};

    #[test]
    fn records_encode_to_vectors() {
        for (vector, record) in record_vectors() {
            assert_eq!(
                hex_encode(&record.encode().unwrap()),
                vector.expected_hex,
                "Vector {} failed: {}",
                vector.id,
                vector.description
            );
        }
    }

    #[test]
    fn vectors_decode_to_records() {
        for (vector, record) in record_vectors() {
            let bytes = hex_decode(&vector.expected_hex);
            match JournalRecord::decode(&bytes).unwrap() {
                Decoded::Record { record: decoded, len } => {
                    assert_eq!(decoded, record, "vector {}", vector.id);
                    assert_eq!(len, bytes.len());
                }
                Decoded::End => panic!("vector {} decoded as end of data", vector.id),
            }
        }
    }

    #[test]
    fn header_matches_vector() {
        let (vector, file_id) = header_vector();
        let header = encode_header(file_id);
        assert_eq!(hex_encode(&header), vector.expected_hex);
        assert_eq!(
            decode_header("v", &header).unwrap(),
            HeaderKind::Data(file_id)
        );
    }

    #[test]
    fn test_all_vectors_json() {
        let json = all_vectors_json();
        assert!(json.contains("\"records\""));
        assert!(json.contains("rollback"));
        let parsed: AllTestVectors = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.records.len(), 6);
    }
}
