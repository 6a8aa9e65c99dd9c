//! Client identity smuggled inside the TLS ClientHello `random`.
//!
//! The 32-byte random is laid out as: 4 bytes of little-endian unix time,
//! 12 bytes of fresh CSPRNG output, then the 16-byte client UUID masked by
//! XOR with the rng bytes (cycled) and encrypted with AES-128-CBC under the
//! channel UUID. The IV is the key itself; that is a wire-compatibility
//! quirk of deployed peers, not a confidentiality primitive, and must stay.
//! The encoded identity is an authenticator tag: decoding it with the right
//! channel key yields a registered client UUID, anything else yields noise.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use uuid::Uuid;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const RANDOM_LENGTH: usize = 32;
/// Offset of the random within the raw ClientHello flight: 5 bytes of record
/// header, 4 of handshake header, 2 of legacy version.
pub const RANDOM_OFFSET: usize = 11;

const RNG_RANGE: std::ops::Range<usize> = 4..16;
const IDENTITY_RANGE: std::ops::Range<usize> = 16..32;

/// AES-128-CBC over whole blocks, IV = leading 16 bytes of the key.
fn aes_encrypt_cbc(data: &mut [u8; 16], key: &[u8; 16]) {
    Aes128CbcEnc::new(key.into(), key.into())
        .encrypt_padded_mut::<NoPadding>(data, 16)
        .expect("single block fits");
}

fn aes_decrypt_cbc(data: &mut [u8; 16], key: &[u8; 16]) {
    Aes128CbcDec::new(key.into(), key.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .expect("single block fits");
}

/// Build the 32-byte random from explicit time and rng material.
pub fn encode_hello_random_parts(
    unix_time: u32,
    rng: &[u8; 12],
    channel_uuid: &Uuid,
    client_uuid: &Uuid,
) -> [u8; RANDOM_LENGTH] {
    let mut random = [0u8; RANDOM_LENGTH];
    random[0..4].copy_from_slice(&unix_time.to_le_bytes());
    random[RNG_RANGE].copy_from_slice(rng);

    let mut origin = *client_uuid.as_bytes();
    for (i, byte) in origin.iter_mut().enumerate() {
        *byte ^= rng[i % rng.len()];
    }
    aes_encrypt_cbc(&mut origin, channel_uuid.as_bytes());
    random[IDENTITY_RANGE].copy_from_slice(&origin);
    random
}

/// Build the 32-byte random with the current time and fresh rng bytes.
pub fn encode_hello_random(channel_uuid: &Uuid, client_uuid: &Uuid) -> [u8; RANDOM_LENGTH] {
    let unix_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    let mut rng = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut rng);
    encode_hello_random_parts(unix_time, &rng, channel_uuid, client_uuid)
}

/// Recover the claimed client UUID from a captured random. The result is
/// only meaningful if it matches a registered client; for any other input
/// this returns an arbitrary value, never an error.
pub fn decode_hello_random(random: &[u8; RANDOM_LENGTH], channel_uuid: &Uuid) -> Uuid {
    let mut identity: [u8; 16] = random[IDENTITY_RANGE].try_into().unwrap();
    aes_decrypt_cbc(&mut identity, channel_uuid.as_bytes());
    let rng = &random[RNG_RANGE];
    for (i, byte) in identity.iter_mut().enumerate() {
        *byte ^= rng[i % rng.len()];
    }
    Uuid::from_bytes(identity)
}
