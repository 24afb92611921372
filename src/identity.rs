//! Identity (DID) operation payloads (spec §4.9; grounded on
//! `examples/original_source/SDK/Implement/IDChainSubWallet.cpp`).

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::address::{Address, AddressKind};
use crate::error::{WalletError, WalletResult};
use crate::subaccount::{Signature, SubAccount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DIDOperation {
    Create,
    Update,
    Deactivate,
}

impl DIDOperation {
    fn as_str(self) -> &'static str {
        match self {
            DIDOperation::Create => "create",
            DIDOperation::Update => "update",
            DIDOperation::Deactivate => "deactivate",
        }
    }
}

impl FromStr for DIDOperation {
    type Err = WalletError;

    fn from_str(s: &str) -> WalletResult<DIDOperation> {
        match s {
            "create" => Ok(DIDOperation::Create),
            "update" => Ok(DIDOperation::Update),
            "deactivate" => Ok(DIDOperation::Deactivate),
            other => Err(WalletError::InvalidArgument(format!("invalid DID operation {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDHeader {
    pub specification: String,
    pub operation: DIDOperation,
}

pub const DID_SPECIFICATION: &str = "elastos/did/1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDPublicKeyInfo {
    pub id: String,
    pub public_key_base58: String,
    pub controller: Option<String>,
}

/// Caller-supplied public key entry: either hex or base58 is provided; hex
/// is converted to base58 so both fields serialize (spec §4.9 step 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInput {
    pub id: String,
    pub public_key_hex: Option<String>,
    pub public_key_base58: Option<String>,
    pub controller: Option<String>,
}

/// The fields the original checks, in the exact order it checks them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSubject {
    pub id: String,
    pub phone: String,
    pub alipay: String,
    pub wechat: String,
    pub weibo: String,
    pub twitter: String,
    pub facebook: String,
    pub microsoft_passport: String,
    pub google_account: String,
    pub homepage: String,
    pub email: String,
}

/// Derives the `VerifiableCredential.type` list (spec §4.9 step 4,
/// SPEC_FULL.md §B.2): base list always present, `PhoneCredential` iff
/// `phone` is non-empty, `InternetAccountCredential` iff any of the nine
/// listed fields are non-empty, in that exact order.
pub fn verifiable_credential_types(subject: &CredentialSubject) -> Vec<String> {
    let mut types = vec!["SelfProclaimedCredential".to_string(), "BasicProfileCredential".to_string()];
    if !subject.phone.is_empty() {
        types.push("PhoneCredential".to_string());
    }
    let has_internet_account = !subject.alipay.is_empty()
        || !subject.wechat.is_empty()
        || !subject.weibo.is_empty()
        || !subject.twitter.is_empty()
        || !subject.facebook.is_empty()
        || !subject.microsoft_passport.is_empty()
        || !subject.google_account.is_empty()
        || !subject.homepage.is_empty()
        || !subject.email.is_empty();
    if has_internet_account {
        types.push("InternetAccountCredential".to_string());
    }
    types
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableCredential {
    pub id: String,
    #[serde(rename = "type")]
    pub types: Vec<String>,
    pub issuer_date: String,
    pub credential_subject: CredentialSubject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDProof {
    pub verification_method: String,
    pub signature: String,
}

/// The payload fields that participate in `source_data` (everything except
/// `proof`, which does not exist yet while signing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDPayloadInfo {
    pub id: String,
    pub expires: String,
    pub public_key: Vec<DIDPublicKeyInfo>,
    pub verifiable_credential: Vec<VerifiableCredential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DIDInfo {
    pub header: DIDHeader,
    pub payload: DIDPayloadInfo,
    pub proof: Option<DIDProof>,
}

/// Caller-facing descriptor, one step removed from the wire `DIDInfo`
/// (spec §4.9 preamble).
#[derive(Debug, Clone)]
pub struct DIDDescriptor {
    pub id: String,
    pub operation: DIDOperation,
    pub public_keys: Vec<PublicKeyInput>,
    pub credential_subject: CredentialSubject,
    pub expires: String,
}

/// Parses `"did:elastos:<addr>"`, validating `<addr>` decodes to an
/// id-chain address (spec §4.9 step 1).
pub fn parse_did_id(id: &str) -> WalletResult<Address> {
    let parts: Vec<&str> = id.split(':').collect();
    if parts.len() != 3 || parts[0] != "did" {
        return Err(WalletError::InvalidArgument(format!("invalid DID id format: {}", id)));
    }
    let address: Address = parts[2]
        .parse()
        .map_err(|_| WalletError::InvalidArgument(format!("invalid address in DID id: {}", parts[2])))?;
    if address.kind() != AddressKind::Did {
        return Err(WalletError::InvalidArgument("DID id does not decode to an id-chain address".into()));
    }
    Ok(address)
}

fn resolve_public_key(input: &PublicKeyInput) -> WalletResult<DIDPublicKeyInfo> {
    let public_key_base58 = match (&input.public_key_hex, &input.public_key_base58) {
        (Some(hex_key), _) => {
            let bytes = hex::decode(hex_key).map_err(|e| WalletError::InvalidArgument(e.to_string()))?;
            bs58::encode(bytes).into_string()
        }
        (None, Some(b58)) => b58.clone(),
        (None, None) => return Err(WalletError::InvalidArgument("publicKey entry has neither hex nor base58 form".into())),
    };
    Ok(DIDPublicKeyInfo {
        id: input.id.clone(),
        public_key_base58,
        controller: input.controller.clone(),
    })
}

fn issuer_date(now: DateTime<Utc>) -> String {
    // UTC, not local time plus a trailing `Z` (spec §9 open question,
    // resolved in SPEC_FULL.md §C): the `Z` is correct because `now` really
    // is UTC.
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn validate_rfc3339(date: &str) -> WalletResult<()> {
    DateTime::parse_from_rfc3339(date)
        .map(|_| ())
        .map_err(|_| WalletError::InvalidDate(date.to_string()))
}

/// Canonical JSON of the payload fields that exist before signing (no
/// `proof` yet) — this is what gets hashed into `source_data`.
fn canonical_payload_json(payload: &DIDPayloadInfo) -> String {
    serde_json::to_string(payload).expect("DID payload always serializes")
}

/// Assembles a [`DIDInfo`] and signs it (spec §4.9 steps 2–9).
pub fn build_did_info(
    descriptor: &DIDDescriptor,
    now: DateTime<Utc>,
    sub_account: &dyn SubAccount,
    password: &str,
) -> WalletResult<(DIDInfo, Address)> {
    let id_address = parse_did_id(&descriptor.id)?;
    validate_rfc3339(&descriptor.expires)?;

    let header = DIDHeader {
        specification: DID_SPECIFICATION.to_string(),
        operation: descriptor.operation,
    };

    let public_keys: Vec<DIDPublicKeyInfo> = descriptor
        .public_keys
        .iter()
        .map(resolve_public_key)
        .collect::<WalletResult<_>>()?;

    let types = verifiable_credential_types(&descriptor.credential_subject);
    let credential = VerifiableCredential {
        id: descriptor.id.clone(),
        types,
        issuer_date: issuer_date(now),
        credential_subject: descriptor.credential_subject.clone(),
    };

    let payload = DIDPayloadInfo {
        id: descriptor.id.clone(),
        expires: descriptor.expires.clone(),
        public_key: public_keys,
        verifiable_credential: vec![credential],
    };

    let source_data = format!(
        "{}{}{}",
        header.specification,
        header.operation.as_str(),
        canonical_payload_json(&payload)
    );

    let Signature(signature_bytes) = sub_account.sign_with_did(&id_address, source_data.as_bytes(), password)?;
    let proof = DIDProof {
        verification_method: "#primary".to_string(),
        signature: BASE64.encode(&signature_bytes),
    };

    Ok((
        DIDInfo {
            header,
            payload,
            proof: Some(proof),
        },
        id_address,
    ))
}

pub fn base64_decode(s: &str) -> WalletResult<Vec<u8>> {
    BASE64.decode(s).map_err(|e| WalletError::InvalidArgument(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_types_follow_fixed_order() {
        let mut subject = CredentialSubject::default();
        assert_eq!(
            verifiable_credential_types(&subject),
            vec!["SelfProclaimedCredential", "BasicProfileCredential"]
        );
        subject.email = "a@b.com".to_string();
        assert_eq!(
            verifiable_credential_types(&subject),
            vec!["SelfProclaimedCredential", "BasicProfileCredential", "InternetAccountCredential"]
        );
        subject.phone = "123".to_string();
        assert_eq!(
            verifiable_credential_types(&subject),
            vec![
                "SelfProclaimedCredential",
                "BasicProfileCredential",
                "PhoneCredential",
                "InternetAccountCredential"
            ]
        );
    }

    #[test]
    fn base64_round_trips() {
        for input in [b"".as_slice(), b"f", b"fo", b"foo", b"foob", b"fooba", b"foobar"] {
            let encoded = BASE64.encode(input);
            assert_eq!(base64_decode(&encoded).unwrap(), input);
        }
    }

    #[test]
    fn rejects_non_rfc3339_expiry() {
        assert!(validate_rfc3339("2030-01-01T00:00:00Z").is_ok());
        assert!(validate_rfc3339("not-a-date").is_err());
    }

    #[test]
    fn parse_did_id_requires_three_parts() {
        assert!(parse_did_id("did:elastos").is_err());
    }
}
