//! EIP-191 signing and verification helpers for EVM wallets
//!
//! # Security
//!
//! - Messages are hashed with the personal_sign prefix:
//!   `"\x19Ethereum Signed Message:\n" + len + message`
//! - Signer recovery compares the recovered address case-insensitively
//! - Both legacy (27/28) and raw (0/1) recovery ids are accepted

use alloy::primitives::{keccak256, PrimitiveSignature, B256, U256};
use alloy::signers::k256::ecdsa::{SigningKey, VerifyingKey};
use thiserror::Error;

/// Length of an r || s || v signature in bytes
const SIGNATURE_LENGTH: usize = 65;

/// Errors produced while handling signatures and addresses
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Invalid signature format: {0}")]
    InvalidSignature(String),

    #[error("Signature verification failed: signer does not match expected address")]
    SignerMismatch,

    #[error("Invalid address format: {0}")]
    InvalidAddress(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Validate Ethereum address format (0x + 40 hex chars)
pub fn validate_evm_address(address: &str) -> Result<(), SignatureError> {
    if !address.starts_with("0x") {
        return Err(SignatureError::InvalidAddress(
            "Address must start with 0x".to_string(),
        ));
    }

    if address.len() != 42 {
        return Err(SignatureError::InvalidAddress(format!(
            "Address must be 42 characters, got {}",
            address.len()
        )));
    }

    if hex::decode(&address[2..]).is_err() {
        return Err(SignatureError::InvalidAddress(
            "Invalid hex characters".to_string(),
        ));
    }

    Ok(())
}

/// Create EIP-191 prefixed message hash
pub fn eip191_hash(message: &str) -> B256 {
    let prefixed = format!("\x19Ethereum Signed Message:\n{}{}", message.len(), message);
    keccak256(prefixed.as_bytes())
}

/// Convert a public key to a lowercase 0x-prefixed Ethereum address
pub fn pubkey_to_address(pubkey: &VerifyingKey) -> String {
    // Uncompressed point is 0x04 || X || Y; the address is the last 20 bytes
    // of keccak256(X || Y)
    let encoded = pubkey.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Recover the address that produced an EIP-191 signature over `message`
pub fn recover_signer(message: &str, signature: &str) -> Result<String, SignatureError> {
    let sig_hex = signature.strip_prefix("0x").unwrap_or(signature);
    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| SignatureError::InvalidSignature(format!("Invalid hex: {}", e)))?;

    if sig_bytes.len() != SIGNATURE_LENGTH {
        return Err(SignatureError::InvalidSignature(format!(
            "Expected {} bytes, got {}",
            SIGNATURE_LENGTH,
            sig_bytes.len()
        )));
    }

    let v = sig_bytes[64];
    let v_normalized = if v >= 27 { v - 27 } else { v };
    if v_normalized > 1 {
        return Err(SignatureError::InvalidSignature(format!(
            "Invalid recovery id: {}",
            v
        )));
    }

    let signature = PrimitiveSignature::new(
        U256::from_be_slice(&sig_bytes[0..32]),
        U256::from_be_slice(&sig_bytes[32..64]),
        v_normalized != 0,
    );

    let recovered_key = signature
        .recover_from_prehash(&eip191_hash(message))
        .map_err(|e| SignatureError::InvalidSignature(format!("Recovery failed: {}", e)))?;

    Ok(pubkey_to_address(&recovered_key))
}

/// Verify that `expected_address` signed `message`
///
/// Returns the recovered address on success.
pub fn verify_signature(
    message: &str,
    signature: &str,
    expected_address: &str,
) -> Result<String, SignatureError> {
    validate_evm_address(expected_address)?;

    let recovered = recover_signer(message, signature)?;
    if recovered.to_lowercase() != expected_address.to_lowercase() {
        return Err(SignatureError::SignerMismatch);
    }

    Ok(recovered)
}

/// Produce a 0x-prefixed r || s || v signature (v = 27/28) over `message`
pub fn sign_eip191(key: &SigningKey, message: &str) -> Result<String, SignatureError> {
    let digest = eip191_hash(message);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(digest.as_slice())
        .map_err(|e| SignatureError::Signing(e.to_string()))?;

    let mut bytes = signature.to_bytes().to_vec();
    bytes.push(recovery_id.to_byte() + 27);

    Ok(format!("0x{}", hex::encode(bytes)))
}
