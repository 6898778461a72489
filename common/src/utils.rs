//! Utility functions for identifiers and chat attachments

use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Generate a base58-encoded UUID v4, used as the deal uid.
pub fn generate_base58_uid() -> String {
    let uuid = Uuid::new_v4();
    bs58::encode(uuid.as_bytes()).into_string()
}

/// Validate that a deal uid is base58 and decodes to a 16-byte UUID.
pub fn validate_base58_uid(uid: &str) -> Result<()> {
    let bytes = bs58::decode(uid)
        .into_vec()
        .map_err(|e| Error::InvalidDealUid(format!("{uid}: {e}")))?;
    if bytes.len() != 16 {
        return Err(Error::InvalidDealUid(format!(
            "{uid}: decodes to {} bytes, expected 16",
            bytes.len()
        )));
    }
    Ok(())
}

/// Compute SHA256 hash of data as lowercase hex
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Decode a standard base64 string, rejecting malformed input.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::InvalidInput(format!("invalid base64: {e}")))
}

/// Extract intrinsic pixel dimensions from base64-encoded image data.
///
/// Supports PNG, JPEG and GIF headers. Returns `None` for other formats or
/// truncated data; callers treat a missing result as "dimensions unknown".
pub fn image_dimensions(base64_data: &str) -> Option<(u32, u32)> {
    let bytes = decode_base64(base64_data).ok()?;
    image_dimensions_from_bytes(&bytes)
}

/// Dimension extraction over already-decoded bytes.
pub fn image_dimensions_from_bytes(bytes: &[u8]) -> Option<(u32, u32)> {
    png_dimensions(bytes)
        .or_else(|| jpeg_dimensions(bytes))
        .or_else(|| gif_dimensions(bytes))
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    if bytes.len() < 24 || &bytes[..8] != SIGNATURE || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 4 || bytes[0] != 0xff || bytes[1] != 0xd8 {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xff {
            return None;
        }
        let marker = bytes[pos + 1];
        // Start-of-frame markers carry the dimensions; C4/C8/CC do not
        let is_sof = (0xc0..=0xcf).contains(&marker)
            && marker != 0xc4
            && marker != 0xc8
            && marker != 0xcc;
        let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if is_sof {
            if pos + 9 > bytes.len() {
                return None;
            }
            let height = u16::from_be_bytes([bytes[pos + 5], bytes[pos + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[pos + 7], bytes[pos + 8]]) as u32;
            return Some((width, height));
        }
        pos += 2 + length;
    }
    None
}

fn gif_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 10 || (&bytes[..6] != b"GIF87a" && &bytes[..6] != b"GIF89a") {
        return None;
    }
    let width = u16::from_le_bytes([bytes[6], bytes[7]]) as u32;
    let height = u16::from_le_bytes([bytes[8], bytes[9]]) as u32;
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn base58_uid_round_trip() {
        let uid = generate_base58_uid();
        assert!(validate_base58_uid(&uid).is_ok());
        // base58 of 16 bytes is at most 22 chars
        assert!(uid.len() >= 16 && uid.len() <= 22, "unexpected length: {uid}");
    }

    #[test]
    fn rejects_bad_uids() {
        assert!(validate_base58_uid("0OIl").is_err()); // non-base58 alphabet
        assert!(validate_base58_uid("abc").is_err()); // too short
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn png_dimensions_from_header() {
        let mut png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        png.extend_from_slice(&[8, 6, 0, 0, 0]);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
        assert_eq!(image_dimensions(&encoded), Some((640, 480)));
    }

    #[test]
    fn gif_dimensions_from_header() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&320u16.to_le_bytes());
        gif.extend_from_slice(&200u16.to_le_bytes());
        gif.extend_from_slice(&[0, 0, 0]);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&gif);
        assert_eq!(image_dimensions(&encoded), Some((320, 200)));
    }

    #[test]
    fn jpeg_dimensions_from_sof0() {
        // SOI, APP0 (empty), SOF0 with 100x50
        let mut jpeg = vec![0xff, 0xd8];
        jpeg.extend_from_slice(&[0xff, 0xe0, 0x00, 0x02]); // APP0, length 2
        jpeg.extend_from_slice(&[0xff, 0xc0, 0x00, 0x0b, 0x08]); // SOF0, length 11, precision
        jpeg.extend_from_slice(&50u16.to_be_bytes()); // height
        jpeg.extend_from_slice(&100u16.to_be_bytes()); // width
        jpeg.extend_from_slice(&[0x03, 0x01, 0x22, 0x00]);
        let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
        assert_eq!(image_dimensions(&encoded), Some((100, 50)));
    }

    #[test]
    fn non_image_yields_none() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"plain text payload");
        assert_eq!(image_dimensions(&encoded), None);
        assert_eq!(image_dimensions("!!!not-base64!!!"), None);
    }
}
