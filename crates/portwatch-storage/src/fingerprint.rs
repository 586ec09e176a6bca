//! Identity fingerprints for deduplicating records across scrapes.

use portwatch_core::{NormalizedRecord, RecordError};
use sha2::{Digest, Sha256};

/// Derives the dedup key of a record. Swappable because the upstream never
/// documented which of its identifiers are stable.
pub trait FingerprintPolicy: Send + Sync {
    fn fingerprint(&self, record: &NormalizedRecord) -> Result<String, RecordError>;
}

/// `(name, escale number)` first, then `(secondary id, timestamp)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameSequencePolicy;

impl FingerprintPolicy for NameSequencePolicy {
    fn fingerprint(&self, record: &NormalizedRecord) -> Result<String, RecordError> {
        if let (Some(name), Some(sequence)) = (
            present(record.name.as_deref()),
            present(record.sequence_number.as_deref()),
        ) {
            return Ok(hashed("ns", &[name, sequence]));
        }

        if let (Some(secondary), Some(timestamp)) =
            (present(record.secondary_id.as_deref()), record.timestamp)
        {
            let millis = timestamp.timestamp_millis().to_string();
            return Ok(hashed("st", &[secondary, millis]));
        }

        Err(RecordError::Unidentifiable(format!(
            "no (name, sequence) or (secondary id, timestamp) pair for {}",
            record.name.as_deref().unwrap_or("<unnamed>")
        )))
    }
}

pub fn normalize_component(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn present(value: Option<&str>) -> Option<String> {
    value
        .map(normalize_component)
        .filter(|v| !v.is_empty())
}

fn hashed(tier: &str, components: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tier.as_bytes());
    for component in components {
        hasher.update([0x1f]);
        hasher.update(component.as_bytes());
    }
    format!("{tier}:{}", hex::encode(hasher.finalize()))
}
