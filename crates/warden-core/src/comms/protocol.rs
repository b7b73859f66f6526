//! Per-pair communication protocols.
//!
//! Specific sender -> recipient-kind pairs carry transport contracts:
//! required payload fields, encryption, compression, an integrity checksum,
//! and a priority override. Unknown pairs fall back to the generic
//! protocol. The delivery service consults the matrix before transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::message::MessagePriority;

/// Transport contract for one sender -> recipient pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSpec {
    pub data_format: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub integrity_check: bool,
    #[serde(default)]
    pub priority_override: Option<MessagePriority>,
}

impl ProtocolSpec {
    /// The protocol applied to pairs without a declared contract.
    pub fn generic() -> Self {
        Self {
            data_format: "generic".to_owned(),
            required_fields: Vec::new(),
            encryption: false,
            compression: false,
            integrity_check: false,
            priority_override: None,
        }
    }

    /// Payload fields the contract requires but the value lacks.
    pub fn missing_fields(&self, payload: &serde_json::Value) -> Vec<&str> {
        self.required_fields
            .iter()
            .filter(|field| payload.get(field.as_str()).is_none())
            .map(String::as_str)
            .collect()
    }
}

/// The full pair -> contract table.
pub struct ProtocolMatrix {
    entries: HashMap<(String, String), ProtocolSpec>,
}

impl ProtocolMatrix {
    /// Empty matrix: everything uses the generic protocol.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The platform's built-in contracts:
    /// - security assessments flowing into risk quantification are
    ///   encrypted and compressed;
    /// - evidence packages heading to cryptographic verification are
    ///   encrypted, integrity-checked, and critical;
    /// - regulatory updates broadcast at high priority.
    pub fn with_defaults() -> Self {
        let mut matrix = Self::empty();
        matrix.declare(
            "atlas",
            "prism",
            ProtocolSpec {
                data_format: "security_assessment".to_owned(),
                required_fields: vec![
                    "vulnerabilities".to_owned(),
                    "security_score".to_owned(),
                    "threat_level".to_owned(),
                ],
                encryption: true,
                compression: true,
                integrity_check: false,
                priority_override: Some(MessagePriority::High),
            },
        );
        matrix.declare(
            "clearance",
            "crypto_verification",
            ProtocolSpec {
                data_format: "evidence_package".to_owned(),
                required_fields: vec![
                    "evidence_items".to_owned(),
                    "metadata".to_owned(),
                    "signatures".to_owned(),
                ],
                encryption: true,
                compression: false,
                integrity_check: true,
                priority_override: Some(MessagePriority::Critical),
            },
        );
        matrix.declare(
            "compass",
            "broadcast",
            ProtocolSpec {
                data_format: "regulatory_update".to_owned(),
                required_fields: vec![
                    "framework".to_owned(),
                    "changes".to_owned(),
                    "effective_date".to_owned(),
                ],
                encryption: false,
                compression: false,
                integrity_check: false,
                priority_override: Some(MessagePriority::High),
            },
        );
        matrix
    }

    /// Declare (or replace) the contract for a pair.
    pub fn declare(&mut self, sender: &str, recipient: &str, spec: ProtocolSpec) {
        self.entries
            .insert((sender.to_owned(), recipient.to_owned()), spec);
    }

    /// Contract for a pair, defaulting to [`ProtocolSpec::generic`].
    pub fn get(&self, sender: &str, recipient: &str) -> ProtocolSpec {
        self.entries
            .get(&(sender.to_owned(), recipient.to_owned()))
            .cloned()
            .unwrap_or_else(ProtocolSpec::generic)
    }
}

impl Default for ProtocolMatrix {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_pairs_fall_back_to_generic() {
        let matrix = ProtocolMatrix::with_defaults();
        let spec = matrix.get("pulse", "beacon");
        assert_eq!(spec.data_format, "generic");
        assert!(!spec.encryption);
        assert!(spec.priority_override.is_none());
    }

    #[test]
    fn evidence_to_crypto_is_critical_with_integrity() {
        let matrix = ProtocolMatrix::with_defaults();
        let spec = matrix.get("clearance", "crypto_verification");
        assert!(spec.encryption);
        assert!(spec.integrity_check);
        assert_eq!(spec.priority_override, Some(MessagePriority::Critical));
    }

    #[test]
    fn missing_fields_reports_gaps() {
        let matrix = ProtocolMatrix::with_defaults();
        let spec = matrix.get("atlas", "prism");
        let payload = serde_json::json!({"vulnerabilities": [], "security_score": 10});
        assert_eq!(spec.missing_fields(&payload), vec!["threat_level"]);

        let complete = serde_json::json!({
            "vulnerabilities": [],
            "security_score": 10,
            "threat_level": "low",
        });
        assert!(spec.missing_fields(&complete).is_empty());
    }

    #[test]
    fn declared_pairs_can_be_replaced() {
        let mut matrix = ProtocolMatrix::empty();
        matrix.declare("a", "b", ProtocolSpec::generic());
        let mut spec = ProtocolSpec::generic();
        spec.compression = true;
        matrix.declare("a", "b", spec);
        assert!(matrix.get("a", "b").compression);
    }
}
