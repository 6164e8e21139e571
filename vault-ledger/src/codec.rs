//! Little-endian binary codec for account data, event payloads and
//! instruction arguments (borsh field layout).

use crate::{Error, Pubkey, Result};
use sha2::{Digest, Sha256};

/// First 8 bytes of `sha256(namespace:name)`, the Anchor discriminator
pub fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Append-only byte writer
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer that starts with a discriminator
    pub fn with_discriminator(disc: [u8; 8]) -> Self {
        let mut writer = Self::new();
        writer.bytes(&disc);
        writer
    }

    /// Write raw bytes
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    /// Write a u8
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    /// Write a bool as one byte
    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    /// Write a u16
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// Write a u32
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// Write a u64
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// Write an i64
    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    /// Write a public key
    pub fn pubkey(&mut self, key: &Pubkey) -> &mut Self {
        self.bytes(key.as_bytes())
    }

    /// Write an optional public key (borsh option tag)
    pub fn option_pubkey(&mut self, key: Option<&Pubkey>) -> &mut Self {
        match key {
            Some(key) => self.u8(1).pubkey(key),
            None => self.u8(0),
        }
    }

    /// Finish and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading at offset 0
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Consume the leading discriminator and check it
    pub fn expect_discriminator(&mut self, disc: [u8; 8]) -> Result<()> {
        let found = self.take(8)?;
        if found != disc {
            return Err(Error::Decode("discriminator mismatch".to_string()));
        }
        Ok(())
    }

    /// Remaining unread bytes
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Take `n` raw bytes
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Decode(format!(
                "unexpected end of data: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a u8
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a bool; anything other than 0 or 1 is malformed
    pub fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Decode(format!("invalid bool byte {}", other))),
        }
    }

    /// Read a u16
    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    /// Read a u32
    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Read a u64
    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Read an i64
    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Read a fixed 32-byte array
    pub fn bytes32(&mut self) -> Result<[u8; 32]> {
        self.array()
    }

    /// Read a fixed 64-byte array
    pub fn bytes64(&mut self) -> Result<[u8; 64]> {
        self.array()
    }

    /// Read a public key
    pub fn pubkey(&mut self) -> Result<Pubkey> {
        Ok(Pubkey::new(self.array()?))
    }

    /// Read an optional public key
    pub fn option_pubkey(&mut self) -> Result<Option<Pubkey>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.pubkey()?)),
            other => Err(Error::Decode(format!("invalid option tag {}", other))),
        }
    }
}
