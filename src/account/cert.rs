//! Account certificates.
//!
//! The server carries an ed25519 issuing key. `create-acl-account` takes a
//! PEM-encoded certificate request (requested name + the client's public
//! key) and returns a certificate binding the new account id to that key,
//! signed by the server. Logins key off the SHA-256 fingerprint of the
//! certificate body.

use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::proto::DirectoryError;

const CRQ_LABEL: &str = "SCRIBE CERTIFICATE REQUEST";
const CERT_LABEL: &str = "SCRIBE CERTIFICATE";

/// What a client submits to `create-acl-account`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateRequest {
    /// Requested account name.
    pub name: String,
    /// Hex-encoded ed25519 public key the account will log in with.
    pub public_key: String,
}

impl CertificateRequest {
    pub fn to_pem(&self) -> String {
        pem_encode(CRQ_LABEL, &serde_json::to_vec(self).expect("crq serializes"))
    }

    pub fn from_pem(pem: &str) -> Result<Self, DirectoryError> {
        let bytes = pem_decode(CRQ_LABEL, pem)?;
        serde_json::from_slice(&bytes).map_err(|_| DirectoryError::InvalidCertificate)
    }
}

/// A signed account certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountCertificate {
    pub account_id: String,
    pub name: String,
    /// Hex-encoded ed25519 public key of the holder.
    pub public_key: String,
    /// RFC 3339 issue timestamp.
    pub issued_at: String,
    /// Hex-encoded server signature over the payload fields.
    pub signature: String,
}

impl AccountCertificate {
    fn payload(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}",
            self.account_id, self.name, self.public_key, self.issued_at
        )
        .into_bytes()
    }

    /// SHA-256 over the serialized certificate, hex-encoded. This is the
    /// key the account registry logs in by.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("certificate serializes");
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn to_pem(&self) -> String {
        pem_encode(
            CERT_LABEL,
            &serde_json::to_vec(self).expect("certificate serializes"),
        )
    }

    pub fn from_pem(pem: &str) -> Result<Self, DirectoryError> {
        let bytes = pem_decode(CERT_LABEL, pem)?;
        serde_json::from_slice(&bytes).map_err(|_| DirectoryError::InvalidCertificate)
    }

    /// Check the server signature.
    pub fn verify(&self, issuer: &VerifyingKey) -> Result<(), DirectoryError> {
        let sig_bytes = hex::decode(&self.signature)
            .map_err(|_| DirectoryError::InvalidCertificate)?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| DirectoryError::InvalidCertificate)?;
        issuer
            .verify(&self.payload(), &signature)
            .map_err(|_| DirectoryError::InvalidCertificate)
    }
}

/// Sign a certificate for `account_id` answering `crq`.
pub fn issue(
    signing_key: &SigningKey,
    crq: &CertificateRequest,
    account_id: &str,
) -> AccountCertificate {
    let mut cert = AccountCertificate {
        account_id: account_id.to_string(),
        name: crq.name.clone(),
        public_key: crq.public_key.clone(),
        issued_at: chrono::Utc::now().to_rfc3339(),
        signature: String::new(),
    };
    let signature = signing_key.sign(&cert.payload());
    cert.signature = hex::encode(signature.to_bytes());
    cert
}

// ─── PEM helpers ─────────────────────────────────────────────────────────────

fn pem_encode(label: &str, bytes: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(bytes);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn pem_decode(label: &str, pem: &str) -> Result<Vec<u8>, DirectoryError> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = pem
        .find(&begin)
        .ok_or(DirectoryError::InvalidCertificate)?
        + begin.len();
    let stop = pem.find(&end).ok_or(DirectoryError::InvalidCertificate)?;
    if stop < start {
        return Err(DirectoryError::InvalidCertificate);
    }
    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|_| DirectoryError::InvalidCertificate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn test_crq_pem_round_trip() {
        let crq = CertificateRequest {
            name: "alice".into(),
            public_key: hex::encode([7u8; 32]),
        };
        let pem = crq.to_pem();
        assert!(pem.starts_with("-----BEGIN SCRIBE CERTIFICATE REQUEST-----"));
        assert_eq!(CertificateRequest::from_pem(&pem).unwrap(), crq);
    }

    #[test]
    fn test_issue_and_verify() {
        let key = keypair();
        let crq = CertificateRequest {
            name: "alice".into(),
            public_key: hex::encode([7u8; 32]),
        };
        let cert = issue(&key, &crq, "acct-1");
        cert.verify(&key.verifying_key()).unwrap();

        let other = keypair();
        assert_eq!(
            cert.verify(&other.verifying_key()),
            Err(DirectoryError::InvalidCertificate)
        );
    }

    #[test]
    fn test_fingerprint_is_stable_per_certificate() {
        let key = keypair();
        let crq = CertificateRequest {
            name: "alice".into(),
            public_key: hex::encode([7u8; 32]),
        };
        let cert = issue(&key, &crq, "acct-1");
        let pem = cert.to_pem();
        let back = AccountCertificate::from_pem(&pem).unwrap();
        assert_eq!(cert.fingerprint(), back.fingerprint());
    }

    #[test]
    fn test_garbage_pem_is_invalid_certificate() {
        assert_eq!(
            AccountCertificate::from_pem("not a certificate"),
            Err(DirectoryError::InvalidCertificate)
        );
    }
}
