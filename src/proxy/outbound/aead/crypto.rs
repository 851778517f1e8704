use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{AeadInPlace, Aes128Gcm, KeyInit};
use anyhow::{bail, Result};
use rand::Rng;

use crate::common::error::Error;

pub const PSK_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const LEN_FIELD_SIZE: usize = 2;
/// A payload chunk can have up to 0xFFFF bytes of unencrypted payload.
pub const MAX_CHUNK_SIZE: usize = 65535;
pub const MAX_PADDING_SIZE: usize = 900;

pub const CLIENT_STREAM_HEADER_TYPE: u8 = 0;
pub const SERVER_STREAM_HEADER_TYPE: u8 = 1;

/// type(1) + unix time(8) + length(2)
pub const REQ_FIXED_HEADER_SIZE: usize = 1 + 8 + LEN_FIELD_SIZE;
/// type(1) + unix time(8) + request salt(16) + length(2)
pub const RESP_FIXED_HEADER_SIZE: usize = 1 + 8 + SALT_SIZE + LEN_FIELD_SIZE;

pub const MAX_UNIX_TIME_DIFF_SECS: u64 = 30;

/// 会话子密钥: BLAKE3_derive_key("shadowsocks 2022 session subkey", psk ‖ salt)
pub fn derive_subkey(psk: &[u8; PSK_SIZE], salt: &[u8; SALT_SIZE]) -> [u8; PSK_SIZE] {
    let mut key_material = [0u8; PSK_SIZE + SALT_SIZE];
    key_material[..PSK_SIZE].copy_from_slice(psk);
    key_material[PSK_SIZE..].copy_from_slice(salt);
    let derived = blake3::derive_key("shadowsocks 2022 session subkey", &key_material);
    let mut subkey = [0u8; PSK_SIZE];
    subkey.copy_from_slice(&derived[..PSK_SIZE]);
    subkey
}

/// 单方向的 AEAD 状态: AES-128-GCM + 12 字节计数器 nonce。
/// 每次 seal/open 后 nonce 逐字节进位加一（小端计数）。
pub struct AeadState {
    cipher: Aes128Gcm,
    nonce: [u8; 12],
}

impl std::fmt::Debug for AeadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadState")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl AeadState {
    pub fn new(subkey: &[u8; PSK_SIZE]) -> Self {
        Self {
            cipher: Aes128Gcm::new(GenericArray::from_slice(subkey)),
            nonce: [0u8; 12],
        }
    }

    pub fn from_salt(psk: &[u8; PSK_SIZE], salt: &[u8; SALT_SIZE]) -> Self {
        Self::new(&derive_subkey(psk, salt))
    }

    /// 加密并附上 16 字节 tag
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(plaintext.len() + TAG_SIZE);
        buf.extend_from_slice(plaintext);
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&self.nonce), b"", &mut buf)
            .map_err(|e| anyhow::anyhow!("AES-128-GCM encrypt failed: {}", e))?;
        buf.extend_from_slice(&tag);
        inc_nonce(&mut self.nonce);
        Ok(buf)
    }

    /// 解密带 tag 的密文
    pub fn open(&mut self, ciphertext_with_tag: &[u8]) -> Result<Vec<u8>> {
        if ciphertext_with_tag.len() < TAG_SIZE {
            bail!(
                "ciphertext too short: {} bytes, need at least {} for tag",
                ciphertext_with_tag.len(),
                TAG_SIZE
            );
        }
        let ct_len = ciphertext_with_tag.len() - TAG_SIZE;
        let mut buf = ciphertext_with_tag[..ct_len].to_vec();
        let tag = &ciphertext_with_tag[ct_len..];
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&self.nonce),
                b"",
                &mut buf,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| Error::AuthFailure("AEAD open failed".into()))?;
        inc_nonce(&mut self.nonce);
        Ok(buf)
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> &[u8; 12] {
        &self.nonce
    }
}

fn inc_nonce(nonce: &mut [u8; 12]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return;
        }
    }
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill(&mut salt);
    salt
}

/// 首包反探测: 以两种豁免模式之一覆写 salt 的前 6 字节，
/// 使首包前缀呈现为纯 ASCII 或 TLS 记录而非全随机密文。
/// 参见 https://gfw.report/publications/usenixsecurity23/en/
pub fn apply_exemption_prefix(salt: &mut [u8; SALT_SIZE]) {
    const EX5_PATTERNS: [&[u8]; 6] = [
        b"GET ",
        b"HEAD ",
        b"POST ",
        b"PUT ",
        b"\x16\x03\x02",
        b"\x16\x03\x03",
    ];
    let mut rng = rand::thread_rng();
    if rng.gen_bool(0.5) {
        // Ex2: printable ASCII
        for b in salt[..6].iter_mut() {
            *b = rng.gen_range(0x20..=0x7e);
        }
    } else {
        // Ex5: protocol-looking prefix
        let pattern = EX5_PATTERNS[rng.gen_range(0..EX5_PATTERNS.len())];
        salt[..pattern.len()].copy_from_slice(pattern);
    }
}

pub fn unix_time_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 校验对端时间戳与本地时间差不超过 30 秒
pub fn validate_unix_time(ts_be: &[u8]) -> Result<()> {
    let mut bs = [0u8; 8];
    bs.copy_from_slice(&ts_be[..8]);
    let received = u64::from_be_bytes(bs);
    let now = unix_time_now();
    let diff = received.max(now) - received.min(now);
    if diff > MAX_UNIX_TIME_DIFF_SECS {
        return Err(Error::ClockSkew(format!(
            "received time was '{}' and now it is {}",
            received, now
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subkey_depends_on_psk_and_salt() {
        let psk = [0x42u8; 16];
        let salt_a = [0x01u8; 16];
        let salt_b = [0x02u8; 16];
        assert_ne!(derive_subkey(&psk, &salt_a), derive_subkey(&psk, &salt_b));
        assert_eq!(derive_subkey(&psk, &salt_a), derive_subkey(&psk, &salt_a));
    }

    #[test]
    fn seal_open_roundtrip() {
        let subkey = [0x42u8; 16];
        let mut sealer = AeadState::new(&subkey);
        let mut opener = AeadState::new(&subkey);

        for payload in [&b"hello"[..], b"", b"another chunk"] {
            let sealed = sealer.seal(payload).unwrap();
            assert_eq!(sealed.len(), payload.len() + TAG_SIZE);
            assert_eq!(opener.open(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn nonce_is_little_endian_counter() {
        let subkey = [0u8; 16];
        let mut state = AeadState::new(&subkey);
        assert_eq!(state.nonce(), &[0u8; 12]);

        for expected in 1u64..=300 {
            state.seal(b"x").unwrap();
            let mut want = [0u8; 12];
            want[..8].copy_from_slice(&expected.to_le_bytes());
            assert_eq!(state.nonce(), &want, "after {} seals", expected);
        }
    }

    #[test]
    fn nonce_carry_propagates() {
        let mut nonce = [0xffu8, 0xff, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        inc_nonce(&mut nonce);
        assert_eq!(&nonce[..3], &[0, 0, 1]);
    }

    #[test]
    fn desynchronized_nonce_fails_open() {
        let subkey = [7u8; 16];
        let mut sealer = AeadState::new(&subkey);
        let mut opener = AeadState::new(&subkey);

        let first = sealer.seal(b"first").unwrap();
        let second = sealer.seal(b"second").unwrap();
        // skipping the first chunk desynchronizes the counters
        assert!(opener.open(&second).is_err());
        let _ = first;
    }

    #[test]
    fn open_rejects_tampered_tag() {
        let subkey = [9u8; 16];
        let mut sealer = AeadState::new(&subkey);
        let mut opener = AeadState::new(&subkey);
        let mut sealed = sealer.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(opener.open(&sealed).is_err());
    }

    #[test]
    fn exemption_prefix_shapes() {
        for _ in 0..64 {
            let mut salt = generate_salt();
            apply_exemption_prefix(&mut salt);
            let printable = salt[..6].iter().all(|&b| (0x20..=0x7e).contains(&b));
            let known_prefix = [
                &b"GET "[..],
                b"HEAD ",
                b"POST ",
                b"PUT ",
                b"\x16\x03\x02",
                b"\x16\x03\x03",
            ]
            .iter()
            .any(|p| salt.starts_with(p));
            assert!(printable || known_prefix);
        }
    }

    #[test]
    fn timestamp_window() {
        let now = unix_time_now();
        assert!(validate_unix_time(&now.to_be_bytes()).is_ok());
        assert!(validate_unix_time(&(now - 29).to_be_bytes()).is_ok());
        assert!(validate_unix_time(&(now - 31).to_be_bytes()).is_err());
        assert!(validate_unix_time(&(now + 31).to_be_bytes()).is_err());
    }
}
