//! Cryptographic functions for the Security Manager Protocol
//!
//! This module implements the security function toolbox of the Security
//! Manager: the AES-128 block function `e`, AES-CMAC, the legacy confirm and
//! key functions `c1`/`s1`, the Secure Connections functions `f4`, `f5`,
//! `f6`, `g2`, the address hash `ah`, and P-256 key agreement.
//!
//! 128-bit values are passed as `u128` whose big-endian byte form is the
//! most-significant-octet-first input the functions are defined over.
//! 256-bit coordinates and DHKeys are passed big-endian as `[u8; 32]`.

use super::constants::*;
use super::types::*;
use crate::gap::{Address, BdAddr};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::{CryptoRng, Rng, RngCore};
use zeroize::{Zeroize, Zeroizing};

/// SALT used by f5 to derive T from the DHKey
const F5_SALT: u128 = 0x6C88_8391_AAF5_A538_6037_0BDB_5A60_83BE;
/// keyID "btle"
const F5_KEY_ID: [u8; 4] = [0x62, 0x74, 0x6C, 0x65];
/// f5 output length in bits (256)
const F5_LENGTH: [u8; 2] = [0x01, 0x00];

fn to_u128(bytes: &[u8]) -> u128 {
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes[..16]);
    u128::from_be_bytes(out)
}

/// Security function e: AES-128 encryption of one block
pub fn e(key: u128, plaintext: u128) -> u128 {
    let key_bytes = Zeroizing::new(key.to_be_bytes());
    let cipher = Aes128::new(GenericArray::from_slice(&key_bytes[..]));
    let mut block = GenericArray::clone_from_slice(&plaintext.to_be_bytes());
    cipher.encrypt_block(&mut block);
    to_u128(&block)
}

/// AES-CMAC (RFC 4493) over a most-significant-octet-first message
pub fn aes_cmac(key: u128, message: &[u8]) -> u128 {
    let key_bytes = Zeroizing::new(key.to_be_bytes());
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(&key_bytes[..]));
    mac.update(message);
    to_u128(&mac.finalize().into_bytes())
}

/// Function c1 for LE Legacy Pairing confirm values
///
/// `preq` and `pres` are the Pairing Request and Response PDUs exactly as
/// sent on the wire, opcode first.
#[allow(clippy::too_many_arguments)]
pub fn c1(
    k: u128,
    r: u128,
    preq: &[u8; 7],
    pres: &[u8; 7],
    iat: u8,
    ia: &BdAddr,
    rat: u8,
    ra: &BdAddr,
) -> u128 {
    // p1 = pres || preq || rat || iat, least significant octet first below
    let mut p1 = [0u8; 16];
    p1[0] = iat;
    p1[1] = rat;
    p1[2..9].copy_from_slice(preq);
    p1[9..16].copy_from_slice(pres);
    let p1 = u128::from_le_bytes(p1);

    // p2 = padding || ia || ra
    let mut p2 = [0u8; 16];
    p2[0..6].copy_from_slice(&ra.bytes);
    p2[6..12].copy_from_slice(&ia.bytes);
    let p2 = u128::from_le_bytes(p2);

    e(k, e(k, r ^ p1) ^ p2)
}

/// Function s1 for the LE Legacy Pairing STK
pub fn s1(k: u128, r1: u128, r2: u128) -> u128 {
    // least significant 64 bits of each
    let r = (r1 << 64) | (r2 & u64::MAX as u128);
    e(k, r)
}

/// Function f4 for LE Secure Connections confirm values
pub fn f4(u: &[u8; 32], v: &[u8; 32], x: u128, z: u8) -> u128 {
    let mut message = [0u8; 65];
    message[0..32].copy_from_slice(u);
    message[32..64].copy_from_slice(v);
    message[64] = z;
    aes_cmac(x, &message)
}

/// Function f5 for LE Secure Connections key generation, returns (MacKey, LTK)
pub fn f5(w: &[u8; 32], n1: u128, n2: u128, a1: &[u8; 7], a2: &[u8; 7]) -> (u128, u128) {
    let mut t = aes_cmac(F5_SALT, w);

    let mut message = [0u8; 53];
    message[1..5].copy_from_slice(&F5_KEY_ID);
    message[5..21].copy_from_slice(&n1.to_be_bytes());
    message[21..37].copy_from_slice(&n2.to_be_bytes());
    message[37..44].copy_from_slice(a1);
    message[44..51].copy_from_slice(a2);
    message[51..53].copy_from_slice(&F5_LENGTH);

    message[0] = 0;
    let mac_key = aes_cmac(t, &message);
    message[0] = 1;
    let ltk = aes_cmac(t, &message);

    t.zeroize();
    (mac_key, ltk)
}

/// Function f6 for LE Secure Connections DHKey check values
#[allow(clippy::too_many_arguments)]
pub fn f6(
    w: u128,
    n1: u128,
    n2: u128,
    r: u128,
    io_cap: &[u8; 3],
    a1: &[u8; 7],
    a2: &[u8; 7],
) -> u128 {
    let mut message = [0u8; 65];
    message[0..16].copy_from_slice(&n1.to_be_bytes());
    message[16..32].copy_from_slice(&n2.to_be_bytes());
    message[32..48].copy_from_slice(&r.to_be_bytes());
    message[48..51].copy_from_slice(io_cap);
    message[51..58].copy_from_slice(a1);
    message[58..65].copy_from_slice(a2);
    aes_cmac(w, &message)
}

/// Function g2 for LE Secure Connections numeric comparison values
pub fn g2(u: &[u8; 32], v: &[u8; 32], x: u128, y: u128) -> u32 {
    let mut message = [0u8; 80];
    message[0..32].copy_from_slice(u);
    message[32..64].copy_from_slice(v);
    message[64..80].copy_from_slice(&y.to_be_bytes());
    (aes_cmac(x, &message) as u32) % (SMP_PASSKEY_MAX + 1)
}

/// Random address hash function ah
pub fn ah(irk: u128, prand: u32) -> u32 {
    (e(irk, (prand & 0x00FF_FFFF) as u128) & 0x00FF_FFFF) as u32
}

/// Check whether a resolvable private address was generated from `irk`
pub fn resolves(irk: u128, address: &Address) -> bool {
    if !address.is_resolvable_private() {
        return false;
    }
    let b = &address.bdaddr.bytes;
    let hash = u32::from_le_bytes([b[0], b[1], b[2], 0]);
    let prand = u32::from_le_bytes([b[3], b[4], b[5], 0]);
    ah(irk, prand) == hash
}

/// Keep the `key_size` least significant octets of a key
pub fn mask_key(key: u128, key_size: u8) -> u128 {
    if key_size >= SMP_MAX_ENCRYPTION_KEY_SIZE {
        key
    } else {
        key & ((1u128 << (8 * key_size as u32)) - 1)
    }
}

/// Generate a 128-bit random number
pub fn random_u128<R: RngCore + CryptoRng>(rng: &mut R) -> u128 {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    u128::from_le_bytes(bytes)
}

/// Generate a random passkey (0-999999)
pub fn generate_passkey<R: RngCore + CryptoRng>(rng: &mut R) -> u32 {
    rng.gen_range(0..=SMP_PASSKEY_MAX)
}

/// P-256 public key as carried in the Pairing Public Key PDU
///
/// Both coordinates are stored least significant octet first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct PublicKeyBytes {
    pub x: [u8; 32],
    pub y: [u8; 32],
}

impl PublicKeyBytes {
    /// X coordinate, most significant octet first
    pub fn x_be(&self) -> [u8; 32] {
        let mut x = self.x;
        x.reverse();
        x
    }

    fn to_sec1(self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[0] = 0x04;
        out[1..33].copy_from_slice(&self.x);
        out[1..33].reverse();
        out[33..65].copy_from_slice(&self.y);
        out[33..65].reverse();
        out
    }
}

/// Reject the identity element, off-curve points and a reflected local key
pub fn validate_public_key(peer: &PublicKeyBytes, local: &PublicKeyBytes) -> SmpResult<PublicKey> {
    if peer.x == [0u8; 32] && peer.y == [0u8; 32] {
        return Err(SmpError::InvalidPublicKey);
    }
    if peer == local {
        return Err(SmpError::InvalidPublicKey);
    }
    PublicKey::from_sec1_bytes(&peer.to_sec1()).map_err(|_| SmpError::InvalidPublicKey)
}

/// Ephemeral P-256 key pair for one Secure Connections pairing
pub struct EcdhKeyPair {
    secret: EphemeralSecret,
    public: PublicKeyBytes,
}

impl EcdhKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = EphemeralSecret::random(rng);
        let point = secret.public_key().to_encoded_point(false);

        let mut public = PublicKeyBytes {
            x: [0u8; 32],
            y: [0u8; 32],
        };
        if let (Some(x), Some(y)) = (point.x(), point.y()) {
            public.x.copy_from_slice(x);
            public.y.copy_from_slice(y);
        }
        public.x.reverse();
        public.y.reverse();

        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKeyBytes {
        &self.public
    }

    /// Validate the peer key, then derive the DHKey (big-endian X coordinate)
    pub fn diffie_hellman(&self, peer: &PublicKeyBytes) -> SmpResult<Zeroizing<[u8; 32]>> {
        let peer_key = validate_public_key(peer, &self.public)?;
        let shared = self.secret.diffie_hellman(&peer_key);
        let mut dh_key = Zeroizing::new([0u8; 32]);
        dh_key.copy_from_slice(shared.raw_secret_bytes());
        Ok(dh_key)
    }
}

/// Secure Connections OOB data: random value and its confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct ScOobData {
    pub r: u128,
    pub c: u128,
}

impl ScOobData {
    pub fn generate<R: RngCore + CryptoRng>(key_pair: &EcdhKeyPair, rng: &mut R) -> Self {
        let r = random_u128(rng);
        let x = key_pair.public_key().x_be();
        Self {
            r,
            c: f4(&x, &x, r, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn be32(text: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        hex::decode_to_slice(text, &mut out).unwrap();
        out
    }

    fn be7(text: &str) -> [u8; 7] {
        let mut out = [0u8; 7];
        hex::decode_to_slice(text, &mut out).unwrap();
        out
    }

    const U: &str = "20b003d2f297be2c5e2c83a7e9f9a5b9eff49111acf4fddbcc0301480e359de6";
    const V: &str = "55188b3d32f6bb9a900afcfbeed4e72a59cb9ac2f19d7cfb6b4fdd49f47fc5fd";
    const N1: u128 = 0xd5cb8454d177733effffb2ec712baeab;
    const N2: u128 = 0xa6e8e7cc25a75f6e216583f7ff3dc4cf;
    const A1: &str = "0056123737bfce";
    const A2: &str = "00a713702dcfc1";

    #[test]
    fn test_aes_cmac_rfc4493() {
        let key = 0x2b7e151628aed2a6abf7158809cf4f3c;
        assert_eq!(aes_cmac(key, &[]), 0xbb1d6929e95937287fa37d129b756746);

        let mut message = [0u8; 16];
        hex::decode_to_slice("6bc1bee22e409f96e93d7e117393172a", &mut message).unwrap();
        assert_eq!(aes_cmac(key, &message), 0x070a16b46b4d4144f79bdd9dd04a287c);
    }

    #[test]
    fn test_c1() {
        let preq = [0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07];
        let pres = [0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05];
        let ia = BdAddr::new([0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1]);
        let ra = BdAddr::new([0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1]);
        let confirm = c1(
            0,
            0x5783D52156AD6F0E6388274EC6702EE0,
            &preq,
            &pres,
            1,
            &ia,
            0,
            &ra,
        );
        assert_eq!(confirm, 0x1e1e3fef878988ead2a74dc5bef13b86);
    }

    #[test]
    fn test_s1() {
        let stk = s1(
            0,
            0x000F0E0D0C0B0A091122334455667788,
            0x010203040506070899AABBCCDDEEFF00,
        );
        assert_eq!(stk, 0x9a1fe1f0e8b0f49b5b4216ae796da062);
    }

    #[test]
    fn test_f4() {
        let confirm = f4(&be32(U), &be32(V), N1, 0);
        assert_eq!(confirm, 0xf2c916f107a9bd1cf1eda1bea974872d);
    }

    #[test]
    fn test_f5() {
        let w = be32("ec0234a357c8ad05341010a60a397d9b99796b13b4f866f1868d34f373bfa698");
        let (mac_key, ltk) = f5(&w, N1, N2, &be7(A1), &be7(A2));
        assert_eq!(mac_key, 0x2965f176a1084a02fd3f6a20ce636e20);
        assert_eq!(ltk, 0x6986791169d7cd23980522b594750a38);
    }

    #[test]
    fn test_f6() {
        let check = f6(
            0x2965f176a1084a02fd3f6a20ce636e20,
            N1,
            N2,
            0x12a3343bb453bb5408da42d20c2d0fc8,
            &[0x01, 0x01, 0x02],
            &be7(A1),
            &be7(A2),
        );
        assert_eq!(check, 0xe3c473989cd0e8c5d26c0b09da958f61);
    }

    #[test]
    fn test_g2() {
        assert_eq!(g2(&be32(U), &be32(V), N1, N2), 938554);
    }

    #[test]
    fn test_ah_and_resolution() {
        let irk = 0xec0234a357c8ad05341010a60a397d9b;
        assert_eq!(ah(irk, 0x708194), 0x0dfbaa);

        // hash in the low half, prand in the high half
        let rpa = Address::random([0xaa, 0xfb, 0x0d, 0x94, 0x81, 0x70]);
        assert!(resolves(irk, &rpa));
        assert!(!resolves(irk + 1, &rpa));
        assert!(!resolves(irk, &Address::public(rpa.bdaddr.bytes)));
    }

    #[test]
    fn test_mask_key() {
        let key = 0x00112233445566778899AABBCCDDEEFF;
        assert_eq!(mask_key(key, 16), key);
        assert_eq!(mask_key(key, 7), 0x0000000000000000_0099AABBCCDDEEFF);
    }

    #[test]
    fn test_ecdh_agreement() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let a = EcdhKeyPair::generate(&mut rng);
        let b = EcdhKeyPair::generate(&mut rng);
        let ab = a.diffie_hellman(b.public_key()).unwrap();
        let ba = b.diffie_hellman(a.public_key()).unwrap();
        assert_eq!(*ab, *ba);
    }

    #[test]
    fn test_invalid_public_keys_rejected() {
        let mut rng = ChaCha12Rng::seed_from_u64(8);
        let local = EcdhKeyPair::generate(&mut rng);

        let zero = PublicKeyBytes {
            x: [0u8; 32],
            y: [0u8; 32],
        };
        assert!(matches!(
            local.diffie_hellman(&zero),
            Err(SmpError::InvalidPublicKey)
        ));

        let mut off_curve = *local.public_key();
        off_curve.y[0] ^= 0x01;
        assert!(matches!(
            local.diffie_hellman(&off_curve),
            Err(SmpError::InvalidPublicKey)
        ));

        assert!(matches!(
            local.diffie_hellman(&local.public_key().clone()),
            Err(SmpError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_oob_confirm_matches_public_key() {
        let mut rng = ChaCha12Rng::seed_from_u64(9);
        let pair = EcdhKeyPair::generate(&mut rng);
        let oob = ScOobData::generate(&pair, &mut rng);
        let x = pair.public_key().x_be();
        assert_eq!(oob.c, f4(&x, &x, oob.r, 0));
    }
}
