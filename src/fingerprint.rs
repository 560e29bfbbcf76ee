use std::str::FromStr;

use base64::Engine;
use md5::Md5;
use russh::keys::ssh_key::authorized_keys::Entry as AuthorizedKeyEntry;
use russh::keys::PublicKey;
use sha2::{Digest, Sha256};

use crate::models::KeyType;

#[derive(Debug, Clone)]
pub enum MalformedKey {
    UnparsableLine(String),
    UnknownAlgorithm(String),
}

impl std::fmt::Display for MalformedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnparsableLine(line) => write!(f, "unparsable key line: {line}"),
            Self::UnknownAlgorithm(algo) => write!(f, "unknown key algorithm: {algo}"),
        }
    }
}

impl std::error::Error for MalformedKey {}

/// A public key recovered from an `authorized_keys` line, an identity
/// `.pub` file, or a host key file, with both fingerprint forms computed.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    pub fingerprint_sha256: String,
    pub fingerprint_md5: String,
    pub key_type: KeyType,
    pub key_bits: Option<i32>,
    pub comment: Option<String>,
}

/// Parses one line of an `authorized_keys` file, discarding any leading
/// options (`command=`, `from=`, ...): only the key material matters here.
pub fn parse_authorized_keys_line(line: &str) -> Result<ParsedKey, MalformedKey> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Err(MalformedKey::UnparsableLine(line.to_owned()));
    }

    let entry = AuthorizedKeyEntry::from_str(trimmed)
        .map_err(|e| MalformedKey::UnparsableLine(format!("{trimmed}: {e}")))?;

    let public_key = entry.public_key();
    let comment = entry.comment();
    from_key_data(public_key, if comment.is_empty() { None } else { Some(comment.to_owned()) })
}

/// Parses a bare public key file (`id_ed25519.pub`, `ssh_host_rsa_key.pub`).
pub fn parse_public_key_file(contents: &str) -> Result<ParsedKey, MalformedKey> {
    let trimmed = contents.trim();
    let key = PublicKey::from_openssh(trimmed)
        .map_err(|e| MalformedKey::UnparsableLine(format!("{trimmed}: {e}")))?;
    let comment = key.comment().to_owned();
    from_key_data(&key, if comment.is_empty() { None } else { Some(comment) })
}

fn from_key_data(
    key: &russh::keys::ssh_key::public::PublicKey,
    comment: Option<String>,
) -> Result<ParsedKey, MalformedKey> {
    let key_type = classify_algorithm(&key.algorithm().to_string())?;
    let key_bits = estimate_bits(key);

    let encoded = key
        .to_bytes()
        .map_err(|e| MalformedKey::UnparsableLine(e.to_string()))?;

    let sha256_digest = Sha256::digest(&encoded);
    let fingerprint_sha256 = format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(sha256_digest)
    );

    let md5_digest = Md5::digest(&encoded);
    let fingerprint_md5 = md5_digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":");

    Ok(ParsedKey {
        fingerprint_sha256,
        fingerprint_md5,
        key_type,
        key_bits,
        comment,
    })
}

fn classify_algorithm(algorithm: &str) -> Result<KeyType, MalformedKey> {
    if algorithm.starts_with("ssh-rsa") || algorithm.starts_with("rsa-") {
        Ok(KeyType::Rsa)
    } else if algorithm.starts_with("ssh-ed25519") {
        Ok(KeyType::Ed25519)
    } else if algorithm.starts_with("ecdsa-") {
        Ok(KeyType::Ecdsa)
    } else if algorithm.starts_with("ssh-dss") {
        Ok(KeyType::Dsa)
    } else {
        Err(MalformedKey::UnknownAlgorithm(algorithm.to_owned()))
    }
}

fn estimate_bits(key: &russh::keys::ssh_key::public::PublicKey) -> Option<i32> {
    use russh::keys::ssh_key::public::KeyData;
    match key.key_data() {
        KeyData::Rsa(rsa) => Some(rsa.n.as_bytes().len() as i32 * 8),
        KeyData::Ed25519(_) => Some(256),
        KeyData::Ecdsa(ecdsa) => Some(match ecdsa {
            russh::keys::ssh_key::public::EcdsaPublicKey::NistP256(_) => 256,
            russh::keys::ssh_key::public::EcdsaPublicKey::NistP384(_) => 384,
            russh::keys::ssh_key::public::EcdsaPublicKey::NistP521(_) => 521,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ED25519_LINE: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJJTh1iOxOcUp6ew4ahGa4B2tUQocNeT92WldnokOaSD alice@example.com";

    #[test]
    fn parses_ed25519_authorized_keys_line() {
        let parsed = parse_authorized_keys_line(ED25519_LINE).expect("should parse");
        assert_eq!(parsed.key_type, KeyType::Ed25519);
        assert_eq!(parsed.key_bits, Some(256));
        assert_eq!(parsed.comment.as_deref(), Some("alice@example.com"));
        assert!(parsed.fingerprint_sha256.starts_with("SHA256:"));
        assert_eq!(parsed.fingerprint_md5.split(':').count(), 16);
    }

    #[test]
    fn parses_with_leading_options() {
        let line = format!("command=\"/bin/true\",no-port-forwarding {ED25519_LINE}");
        let parsed = parse_authorized_keys_line(&line).expect("should parse despite options");
        assert_eq!(parsed.key_type, KeyType::Ed25519);
    }

    #[test]
    fn rejects_blank_and_comment_lines() {
        assert!(parse_authorized_keys_line("").is_err());
        assert!(parse_authorized_keys_line("# a comment").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_authorized_keys_line("not a key at all").is_err());
    }

    #[test]
    fn same_key_produces_same_fingerprint() {
        let a = parse_authorized_keys_line(ED25519_LINE).expect("parse a");
        let b = parse_authorized_keys_line(ED25519_LINE).expect("parse b");
        assert_eq!(a.fingerprint_sha256, b.fingerprint_sha256);
        assert_eq!(a.fingerprint_md5, b.fingerprint_md5);
    }
}
