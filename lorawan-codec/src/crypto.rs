//! The LoRaWAN 1.0.x cryptographic primitives: AES-128 ECB blocks, AES-CMAC,
//! the CTR payload cipher and session-key derivation.
//!
//! All functions are total over their fixed-size inputs; key selection and
//! frame-layout policy live in [`crate::frame`].

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::keys::{AesKey, AppKey, AppSKey, DevAddr, Mic, NwkSKey};

/// AES block size in bytes.
pub const BLOCK_LEN: usize = 16;

/// Link direction, as encoded into the B0 and A crypto blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

/// Encrypts one AES-128 block in place.
pub fn aes128_encrypt(key: &AesKey, block: &mut [u8; BLOCK_LEN]) {
    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// Decrypts one AES-128 block in place.
///
/// Only the network side of a join accept needs this; the device decrypts a
/// join accept by *encrypting* its blocks.
pub fn aes128_decrypt(key: &AesKey, block: &mut [u8; BLOCK_LEN]) {
    let cipher = Aes128::new(GenericArray::from_slice(&key.0));
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

// Cmac implements both KeyInit and Mac, whose `new` signatures collide; the
// qualified path keeps the call unambiguous.
fn new_cmac(key: &AesKey) -> Cmac<Aes128> {
    <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(&key.0))
}

/// AES-CMAC (RFC 4493) over a message.
pub fn cmac16(key: &AesKey, message: &[u8]) -> [u8; BLOCK_LEN] {
    let mut mac = new_cmac(key);
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// MIC of a join frame: the first four CMAC bytes over the whole frame
/// without the MIC field.
pub fn join_mic(key: &AesKey, message: &[u8]) -> Mic {
    truncate(cmac16(key, message))
}

/// MIC of a data frame: CMAC over `B0 || frame-without-MIC`, truncated to
/// four bytes.
pub fn data_mic(
    key: &AesKey,
    direction: Direction,
    dev_addr: &DevAddr,
    fcnt: u32,
    message: &[u8],
) -> Mic {
    let mut b0 = [0u8; BLOCK_LEN];
    b0[0] = 0x49;
    b0[5] = direction as u8;
    b0[6..10].copy_from_slice(dev_addr.as_bytes());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = message.len() as u8;

    let mut mac = new_cmac(key);
    mac.update(&b0);
    mac.update(message);
    truncate(mac.finalize().into_bytes().into())
}

fn truncate(full: [u8; BLOCK_LEN]) -> Mic {
    Mic([full[0], full[1], full[2], full[3]])
}

/// Applies the FRMPayload keystream in place. Encryption and decryption are
/// the same XOR.
///
/// Keystream block `i` is the AES encryption of the A template with the
/// block counter `i + 1` in its final byte.
pub fn ctr_xor(
    key: &AesKey,
    direction: Direction,
    dev_addr: &DevAddr,
    fcnt: u32,
    data: &mut [u8],
) {
    for (i, chunk) in data.chunks_mut(BLOCK_LEN).enumerate() {
        let mut block = [0u8; BLOCK_LEN];
        block[0] = 0x01;
        block[5] = direction as u8;
        block[6..10].copy_from_slice(dev_addr.as_bytes());
        block[10..14].copy_from_slice(&fcnt.to_le_bytes());
        block[15] = (i + 1) as u8;
        aes128_encrypt(key, &mut block);

        for (byte, pad) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= pad;
        }
    }
}

/// Derives the session keys from a join exchange.
///
/// `NwkSKey = aes128(AppKey, 0x01 | AppNonce | NetID | DevNonce | 0^7)` and
/// `AppSKey` the same with `0x02`; the three nonce fields little-endian.
pub fn derive_session_keys(
    app_key: &AppKey,
    app_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_nonce: u16,
) -> (NwkSKey, AppSKey) {
    let mut seed = [0u8; BLOCK_LEN];
    seed[1..4].copy_from_slice(app_nonce);
    seed[4..7].copy_from_slice(net_id);
    seed[7..9].copy_from_slice(&dev_nonce.to_le_bytes());

    let mut nwk = seed;
    nwk[0] = 0x01;
    aes128_encrypt(&app_key.0, &mut nwk);

    let mut app = seed;
    app[0] = 0x02;
    aes128_encrypt(&app_key.0, &mut app);

    (NwkSKey(AesKey(nwk)), AppSKey(AesKey(app)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 4493 test vectors for AES-CMAC
    const RFC4493_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    #[test]
    fn cmac_matches_rfc4493_empty_message() {
        let expected = [
            0xbb, 0x1d, 0x69, 0x29, 0xe9, 0x59, 0x37, 0x28, 0x7f, 0xa3, 0x7d, 0x12, 0x9b, 0x75,
            0x67, 0x46,
        ];
        assert_eq!(cmac16(&AesKey(RFC4493_KEY), &[]), expected);
    }

    #[test]
    fn cmac_matches_rfc4493_one_block() {
        let message = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a,
        ];
        let expected = [
            0x07, 0x0a, 0x16, 0xb4, 0x6b, 0x4d, 0x41, 0x44, 0xf7, 0x9b, 0xdd, 0x9d, 0xd0, 0x4a,
            0x28, 0x7c,
        ];
        assert_eq!(cmac16(&AesKey(RFC4493_KEY), &message), expected);
    }

    #[test]
    fn cmac_matches_rfc4493_forty_bytes() {
        let message = [
            0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93,
            0x17, 0x2a, 0xae, 0x2d, 0x8a, 0x57, 0x1e, 0x03, 0xac, 0x9c, 0x9e, 0xb7, 0x6f, 0xac,
            0x45, 0xaf, 0x8e, 0x51, 0x30, 0xc8, 0x1c, 0x46, 0xa3, 0x5c, 0xe4, 0x11,
        ];
        let expected = [
            0xdf, 0xa6, 0x67, 0x47, 0xde, 0x9a, 0xe6, 0x30, 0x30, 0xca, 0x32, 0x61, 0x14, 0x97,
            0xc8, 0x27,
        ];
        assert_eq!(cmac16(&AesKey(RFC4493_KEY), &message), expected);
    }

    #[test]
    fn block_encrypt_decrypt_are_inverses() {
        let key = AesKey([0x42; 16]);
        let mut block = *b"0123456789abcdef";
        let original = block;
        aes128_encrypt(&key, &mut block);
        assert_ne!(block, original);
        aes128_decrypt(&key, &mut block);
        assert_eq!(block, original);
    }

    #[test]
    fn ctr_xor_is_an_involution() {
        let key = AesKey([0xaa; 16]);
        let addr = DevAddr([0xda, 0x1b, 0x01, 0x26]);
        let mut data = [0u8; 40];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let original = data;

        ctr_xor(&key, Direction::Uplink, &addr, 7, &mut data);
        assert_ne!(data, original);
        ctr_xor(&key, Direction::Uplink, &addr, 7, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn ctr_keystream_depends_on_every_parameter() {
        let key = AesKey([0xaa; 16]);
        let addr = DevAddr([0xda, 0x1b, 0x01, 0x26]);
        let base = {
            let mut d = [0u8; 16];
            ctr_xor(&key, Direction::Uplink, &addr, 7, &mut d);
            d
        };
        let mut by_dir = [0u8; 16];
        ctr_xor(&key, Direction::Downlink, &addr, 7, &mut by_dir);
        assert_ne!(base, by_dir);

        let mut by_fcnt = [0u8; 16];
        ctr_xor(&key, Direction::Uplink, &addr, 8, &mut by_fcnt);
        assert_ne!(base, by_fcnt);

        let mut by_addr = [0u8; 16];
        ctr_xor(&key, Direction::Uplink, &DevAddr([1, 2, 3, 4]), 7, &mut by_addr);
        assert_ne!(base, by_addr);
    }

    #[test]
    fn session_keys_are_deterministic_and_distinct() {
        let app_key = AppKey::from([0x11; 16]);
        let (nwk_a, app_a) = derive_session_keys(&app_key, &[1, 2, 3], &[0x13, 0, 0], 0x102d);
        let (nwk_b, app_b) = derive_session_keys(&app_key, &[1, 2, 3], &[0x13, 0, 0], 0x102d);
        assert_eq!(nwk_a, nwk_b);
        assert_eq!(app_a, app_b);
        assert_ne!(nwk_a.as_bytes(), app_a.as_bytes());

        let (nwk_c, _) = derive_session_keys(&app_key, &[1, 2, 3], &[0x13, 0, 0], 0x102e);
        assert_ne!(nwk_a, nwk_c);
    }
}
