//! ES256 uses a fixed-width `R || S` signature in its compact JWS serialization (RFC 7518
//! §3.4), while KMS asymmetric-sign endpoints (and picky's own `SignatureAlgorithm::sign`)
//! hand back ASN.1 DER. `KeySigner::sign` always returns DER so the trait has one shape
//! regardless of backend; this module does the DER -> fixed-width conversion at the point
//! the minter assembles a JWS.

use anyhow::Context as _;
use picky_asn1_x509::signature::EcdsaSignatureValue;

/// Size in bytes of each of `R` and `S` for the NIST P-256 curve.
pub const P256_COMPONENT_SIZE: usize = 32;

pub fn der_to_fixed_width(der: &[u8], component_size: usize) -> anyhow::Result<Vec<u8>> {
    let signature: EcdsaSignatureValue = picky_asn1_der::from_bytes(der).context("invalid EC DER signature encoding")?;

    let r = signature.r.as_unsigned_bytes_be();
    let s = signature.s.as_unsigned_bytes_be();

    anyhow::ensure!(r.len() <= component_size && s.len() <= component_size, "signature component too large for curve");

    let mut fixed = Vec::with_capacity(component_size * 2);
    fixed.resize(component_size - r.len(), 0);
    fixed.extend_from_slice(r);
    fixed.resize(component_size * 2 - s.len(), 0);
    fixed.extend_from_slice(s);

    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use picky::hash::HashAlgorithm;
    use picky::key::{EcCurve, PrivateKey};
    use picky::signature::SignatureAlgorithm;

    #[test]
    fn der_signature_round_trips_to_fixed_width() {
        let key = PrivateKey::generate_ec(EcCurve::NistP256).unwrap();
        let der = SignatureAlgorithm::Ecdsa(HashAlgorithm::SHA2_256).sign(b"hello", &key).unwrap();

        let fixed = der_to_fixed_width(&der, P256_COMPONENT_SIZE).unwrap();

        assert_eq!(fixed.len(), P256_COMPONENT_SIZE * 2);
    }
}
