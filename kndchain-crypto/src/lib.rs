//! secp256k1 keypair generation, signing and verification: the concrete
//! implementation of `kndchain_core::CryptoProvider`.

use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use kndchain_core::{Address, CryptoError, CryptoProvider};
use rand_core::OsRng;
use signature::{Signer, Verifier};

/// A freshly generated wallet keypair. `private_key` never leaves the
/// process except through the wallet's encrypted keystore.
pub struct KeyPair {
    pub private_key: [u8; 32],
    pub address: Address,
}

pub fn generate_keypair() -> KeyPair {
    let signing_key = SigningKey::random(&mut OsRng);
    let verifying_key = VerifyingKey::from(&signing_key);
    let encoded_point = verifying_key.to_encoded_point(true);
    KeyPair {
        private_key: signing_key.to_bytes().into(),
        address: Address(hex::encode(encoded_point.as_bytes())),
    }
}

pub fn address_from_private_key(private_key: &[u8]) -> Result<Address, CryptoError> {
    let signing_key = SigningKey::from_slice(private_key).map_err(|_| CryptoError::InvalidPubKey)?;
    let verifying_key = VerifyingKey::from(&signing_key);
    let encoded_point = verifying_key.to_encoded_point(true);
    Ok(Address(hex::encode(encoded_point.as_bytes())))
}

#[derive(Debug, Default)]
pub struct Secp256k1Provider;

impl Secp256k1Provider {
    pub fn new() -> Self {
        Self
    }
}

impl CryptoProvider for Secp256k1Provider {
    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signing_key = SigningKey::from_slice(private_key).map_err(|_| CryptoError::InvalidPubKey)?;
        let signature: Signature = signing_key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(&self, address: &Address, message: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
        let pubkey_bytes = hex::decode(address.as_str()).map_err(|_| CryptoError::InvalidPubKey)?;
        let verifying_key =
            VerifyingKey::from_sec1_bytes(&pubkey_bytes).map_err(|_| CryptoError::InvalidPubKey)?;
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        Ok(verifying_key.verify(message, &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let keypair = generate_keypair();
        let provider = Secp256k1Provider::new();
        let message = b"hello kndchain";
        let signature = provider.sign(&keypair.private_key, message).unwrap();
        assert!(provider
            .verify(&keypair.address, message, &signature)
            .unwrap());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = generate_keypair();
        let provider = Secp256k1Provider::new();
        let signature = provider.sign(&keypair.private_key, b"original").unwrap();
        assert!(!provider
            .verify(&keypair.address, b"tampered", &signature)
            .unwrap());
    }

    #[test]
    fn verify_rejects_wrong_address() {
        let sender = generate_keypair();
        let other = generate_keypair();
        let provider = Secp256k1Provider::new();
        let message = b"payload";
        let signature = provider.sign(&sender.private_key, message).unwrap();
        assert!(!provider.verify(&other.address, message, &signature).unwrap());
    }

    #[test]
    fn address_from_private_key_matches_generated_address() {
        let keypair = generate_keypair();
        let derived = address_from_private_key(&keypair.private_key).unwrap();
        assert_eq!(derived, keypair.address);
    }
}
