use crate::packet::SIGNATURE_LEN;
use anyhow::{anyhow, bail};
use bytes::BufMut;
use dsa::{Components, KeySize, Signature, SigningKey, VerifyingKey};
use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use signature::{DigestSigner, DigestVerifier};
use std::fmt::{Debug, Display, Formatter};

pub const ENCRYPTION_KEY_LEN: usize = 256;
pub const DSA_P_LEN: usize = 128;
pub const DSA_Q_LEN: usize = 20;
pub const DSA_G_LEN: usize = 128;
pub const DSA_Y_LEN: usize = 128;
pub const DSA_X_LEN: usize = 20;
pub const CERTIFICATE_LEN: usize = 3;

/// SHA-256 over a serialized `Identity`; the key under which destinations are addressed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentHash([u8; 32]);

impl IdentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> IdentHash {
        IdentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for IdentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for IdentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A destination's public identity as it appears in the FROM option of a SYN packet:
///  the ElGamal encryption key, the DSA domain parameters and public key, and a (null)
///  certificate. Carrying p/q/g inside the identity keeps signature verification
///  self-contained - there is no dependency on a network-wide parameter registry.
#[derive(Clone)]
pub struct Identity {
    pub encryption_key: [u8; ENCRYPTION_KEY_LEN],
    pub dsa_p: [u8; DSA_P_LEN],
    pub dsa_q: [u8; DSA_Q_LEN],
    pub dsa_g: [u8; DSA_G_LEN],
    pub signing_key: [u8; DSA_Y_LEN],
    pub certificate: [u8; CERTIFICATE_LEN],
}

impl Identity {
    pub const SERIALIZED_LEN: usize =
        ENCRYPTION_KEY_LEN + DSA_P_LEN + DSA_Q_LEN + DSA_G_LEN + DSA_Y_LEN + CERTIFICATE_LEN;

    /// Parses an identity from the start of `buf`, returning it along with the number of
    ///  bytes consumed.
    pub fn from_buffer(buf: &[u8]) -> anyhow::Result<(Identity, usize)> {
        if buf.len() < Self::SERIALIZED_LEN {
            bail!("{} bytes are too short for an identity of {}", buf.len(), Self::SERIALIZED_LEN);
        }

        let mut offset = 0;
        let mut identity = Identity {
            encryption_key: [0; ENCRYPTION_KEY_LEN],
            dsa_p: [0; DSA_P_LEN],
            dsa_q: [0; DSA_Q_LEN],
            dsa_g: [0; DSA_G_LEN],
            signing_key: [0; DSA_Y_LEN],
            certificate: [0; CERTIFICATE_LEN],
        };
        for (field, len) in [
            (identity.encryption_key.as_mut_slice(), ENCRYPTION_KEY_LEN),
            (identity.dsa_p.as_mut_slice(), DSA_P_LEN),
            (identity.dsa_q.as_mut_slice(), DSA_Q_LEN),
            (identity.dsa_g.as_mut_slice(), DSA_G_LEN),
            (identity.signing_key.as_mut_slice(), DSA_Y_LEN),
            (identity.certificate.as_mut_slice(), CERTIFICATE_LEN),
        ] {
            field.copy_from_slice(&buf[offset..offset + len]);
            offset += len;
        }
        Ok((identity, offset))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.encryption_key);
        buf.put_slice(&self.dsa_p);
        buf.put_slice(&self.dsa_q);
        buf.put_slice(&self.dsa_g);
        buf.put_slice(&self.signing_key);
        buf.put_slice(&self.certificate);
    }

    pub fn hash(&self) -> IdentHash {
        let mut buf = Vec::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        IdentHash(Sha256::digest(&buf).into())
    }

    fn dsa_verifying_key(&self) -> anyhow::Result<VerifyingKey> {
        let components = Components::from_components(
            BigUint::from_bytes_be(&self.dsa_p),
            BigUint::from_bytes_be(&self.dsa_q),
            BigUint::from_bytes_be(&self.dsa_g),
        )
        .map_err(|e| anyhow!("invalid DSA domain parameters: {}", e))?;

        VerifyingKey::from_components(components, BigUint::from_bytes_be(&self.signing_key))
            .map_err(|e| anyhow!("invalid DSA public key: {}", e))
    }

    /// Checks a raw 40-byte `r || s` signature over `data` against this identity.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> anyhow::Result<()> {
        if signature.len() != SIGNATURE_LEN {
            bail!("signature of {} bytes, expected {}", signature.len(), SIGNATURE_LEN);
        }

        let signature = Signature::from_components(
            BigUint::from_bytes_be(&signature[..SIGNATURE_LEN / 2]),
            BigUint::from_bytes_be(&signature[SIGNATURE_LEN / 2..]),
        )
        .map_err(|e| anyhow!("malformed signature: {}", e))?;

        self.dsa_verifying_key()?
            .verify_digest(Sha1::new().chain_update(data), &signature)
            .map_err(|e| anyhow!("signature verification failed: {}", e))
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("hash", &self.hash()).finish()
    }
}

/// The persisted key material of one local destination - the `.dat` file layout.
#[derive(Clone)]
pub struct PrivateKeys {
    pub encryption_private_key: [u8; ENCRYPTION_KEY_LEN],
    pub signing_private_key: [u8; DSA_X_LEN],
    pub identity: Identity,
}

impl PrivateKeys {
    pub const SERIALIZED_LEN: usize = ENCRYPTION_KEY_LEN + DSA_X_LEN + Identity::SERIALIZED_LEN;

    pub fn from_buffer(buf: &[u8]) -> anyhow::Result<PrivateKeys> {
        if buf.len() < Self::SERIALIZED_LEN {
            bail!("{} bytes are too short for a key blob of {}", buf.len(), Self::SERIALIZED_LEN);
        }

        let encryption_private_key = buf[..ENCRYPTION_KEY_LEN].try_into()?;
        let signing_private_key = buf[ENCRYPTION_KEY_LEN..ENCRYPTION_KEY_LEN + DSA_X_LEN].try_into()?;
        let (identity, _) = Identity::from_buffer(&buf[ENCRYPTION_KEY_LEN + DSA_X_LEN..])?;

        Ok(PrivateKeys {
            encryption_private_key,
            signing_private_key,
            identity,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SERIALIZED_LEN);
        buf.put_slice(&self.encryption_private_key);
        buf.put_slice(&self.signing_private_key);
        self.identity.ser(&mut buf);
        buf
    }

    /// Reconstructs the DSA signing key from the persisted private exponent and the
    ///  parameters embedded in the identity.
    pub fn dsa_signing_key(&self) -> anyhow::Result<SigningKey> {
        let verifying_key = self.identity.dsa_verifying_key()?;
        SigningKey::from_components(verifying_key, BigUint::from_bytes_be(&self.signing_private_key))
            .map_err(|e| anyhow!("inconsistent DSA private key: {}", e))
    }
}

/// Raw 40-byte `r || s` DSA signature over `data`.
pub fn sign(signing_key: &SigningKey, data: &[u8]) -> anyhow::Result<[u8; SIGNATURE_LEN]> {
    let signature: Signature = signing_key
        .try_sign_digest(Sha1::new().chain_update(data))
        .map_err(|e| anyhow!("signing failed: {}", e))?;

    let mut out = [0u8; SIGNATURE_LEN];
    write_fixed_be(signature.r(), &mut out[..SIGNATURE_LEN / 2])?;
    write_fixed_be(signature.s(), &mut out[SIGNATURE_LEN / 2..])?;
    Ok(out)
}

/// Generates fresh key material for a new destination: a DSA-1024/160 keypair with fresh
///  domain parameters, and random ElGamal key blobs. The ElGamal material is opaque to the
///  streaming layer - only the garlic layer interprets it.
pub fn create_random_keys() -> anyhow::Result<PrivateKeys> {
    let components = Components::generate(&mut OsRng, KeySize::DSA_1024_160);
    let signing_key = SigningKey::generate(&mut OsRng, components);
    let verifying_key = signing_key.verifying_key();

    let mut identity = Identity {
        encryption_key: [0; ENCRYPTION_KEY_LEN],
        dsa_p: [0; DSA_P_LEN],
        dsa_q: [0; DSA_Q_LEN],
        dsa_g: [0; DSA_G_LEN],
        signing_key: [0; DSA_Y_LEN],
        certificate: [0; CERTIFICATE_LEN],
    };
    OsRng.fill_bytes(&mut identity.encryption_key);
    write_fixed_be(verifying_key.components().p(), &mut identity.dsa_p)?;
    write_fixed_be(verifying_key.components().q(), &mut identity.dsa_q)?;
    write_fixed_be(verifying_key.components().g(), &mut identity.dsa_g)?;
    write_fixed_be(verifying_key.y(), &mut identity.signing_key)?;

    let mut keys = PrivateKeys {
        encryption_private_key: [0; ENCRYPTION_KEY_LEN],
        signing_private_key: [0; DSA_X_LEN],
        identity,
    };
    OsRng.fill_bytes(&mut keys.encryption_private_key);
    write_fixed_be(signing_key.x(), &mut keys.signing_private_key)?;
    Ok(keys)
}

fn write_fixed_be(value: &BigUint, out: &mut [u8]) -> anyhow::Result<()> {
    let bytes = value.to_bytes_be();
    if bytes.len() > out.len() {
        bail!("value of {} bytes does not fit into {}", bytes.len(), out.len());
    }
    let padding = out.len() - bytes.len();
    out[..padding].fill(0);
    out[padding..].copy_from_slice(&bytes);
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{local_keys, remote_keys};
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keys = local_keys();
        let signature = sign(&keys.dsa_signing_key().unwrap(), b"some data").unwrap();

        keys.identity.verify(b"some data", &signature).unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_data() {
        let keys = local_keys();
        let signature = sign(&keys.dsa_signing_key().unwrap(), b"some data").unwrap();

        assert!(keys.identity.verify(b"other data", &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_tampered_signature() {
        let keys = local_keys();
        let mut signature = sign(&keys.dsa_signing_key().unwrap(), b"some data").unwrap();
        signature[7] ^= 0x01;

        assert!(keys.identity.verify(b"some data", &signature).is_err());
    }

    #[test]
    fn test_verify_rejects_wrong_identity() {
        let signature = sign(&local_keys().dsa_signing_key().unwrap(), b"some data").unwrap();

        assert!(remote_keys().identity.verify(b"some data", &signature).is_err());
    }

    #[test]
    fn test_identity_round_trip() {
        let identity = &local_keys().identity;
        let mut buf = Vec::new();
        identity.ser(&mut buf);
        assert_eq!(buf.len(), Identity::SERIALIZED_LEN);

        let (parsed, consumed) = Identity::from_buffer(&buf).unwrap();
        assert_eq!(consumed, Identity::SERIALIZED_LEN);
        assert_eq!(parsed.hash(), identity.hash());
    }

    #[test]
    fn test_identity_from_buffer_rejects_short_input() {
        assert!(Identity::from_buffer(&[0; Identity::SERIALIZED_LEN - 1]).is_err());
    }

    #[test]
    fn test_private_keys_round_trip() {
        let keys = local_keys();
        let buf = keys.to_bytes();
        assert_eq!(buf.len(), PrivateKeys::SERIALIZED_LEN);

        let parsed = PrivateKeys::from_buffer(&buf).unwrap();
        assert_eq!(parsed.identity.hash(), keys.identity.hash());

        // the reconstructed signing key must produce signatures the identity accepts
        let signature = sign(&parsed.dsa_signing_key().unwrap(), b"round trip").unwrap();
        keys.identity.verify(b"round trip", &signature).unwrap();
    }
}
