use std::path::Path;

use anyhow::{bail, Context, Error};
use openssl::{hash::MessageDigest, pkey::PKey, sign::Verifier};

/// Verifies a detached signature over `data` against a PEM public key.
///
/// The signature is base64 as shipped in the artifact; RSA keys verify
/// PKCS#1 v1.5 over SHA-256, EC keys verify ECDSA over SHA-256.
pub fn verify_detached(public_key_pem: &[u8], data: &[u8], signature_b64: &str) -> Result<(), Error> {
    let key = PKey::public_key_from_pem(public_key_pem)
        .context("Failed to parse verification public key")?;

    let signature = openssl::base64::decode_block(signature_b64.trim())
        .context("Failed to decode artifact signature")?;

    let mut verifier =
        Verifier::new(MessageDigest::sha256(), &key).context("Failed to set up verifier")?;
    verifier
        .update(data)
        .context("Failed to digest signed data")?;

    if !verifier
        .verify(&signature)
        .context("Failed to check artifact signature")?
    {
        bail!("Artifact signature does not match the configured verification key");
    }
    Ok(())
}

/// Loads a PEM public key file and verifies a detached signature with it.
pub fn verify_with_key_file(key_path: &Path, data: &[u8], signature_b64: &str) -> Result<(), Error> {
    let pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read verification key '{}'", key_path.display()))?;
    verify_detached(&pem, data, signature_b64)
}

/// Signs `data` with a PEM private key, producing the base64 signature the
/// artifact format carries. Exposed for artifact tooling and tests.
pub fn sign_detached(private_key_pem: &[u8], data: &[u8]) -> Result<String, Error> {
    let key = PKey::private_key_from_pem(private_key_pem)
        .context("Failed to parse signing private key")?;

    let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), &key)
        .context("Failed to set up signer")?;
    signer.update(data).context("Failed to digest data")?;
    let signature = signer.sign_to_vec().context("Failed to sign data")?;

    Ok(openssl::base64::encode_block(&signature))
}

#[cfg(test)]
mod test {
    use super::*;

    use openssl::rsa::Rsa;

    fn test_keypair() -> (Vec<u8>, Vec<u8>) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        (
            key.private_key_to_pem_pkcs8().unwrap(),
            key.public_key_to_pem().unwrap(),
        )
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (private_pem, public_pem) = test_keypair();
        let data = b"header bytes";

        let signature = sign_detached(&private_pem, data).unwrap();
        verify_detached(&public_pem, data, &signature).unwrap();

        // Tampered data must not verify.
        verify_detached(&public_pem, b"other bytes", &signature).unwrap_err();
    }

    #[test]
    fn test_wrong_key() {
        let (private_pem, _) = test_keypair();
        let (_, other_public) = test_keypair();

        let signature = sign_detached(&private_pem, b"data").unwrap();
        verify_detached(&other_public, b"data", &signature).unwrap_err();
    }

    #[test]
    fn test_garbage_inputs() {
        let (_, public_pem) = test_keypair();
        verify_detached(&public_pem, b"data", "not base64 !!!").unwrap_err();
        verify_detached(b"not a pem", b"data", "aGVsbG8=").unwrap_err();
    }
}
