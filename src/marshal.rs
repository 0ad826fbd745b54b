//! Big-endian TPM structure encoding shared by the TPM 1.2 and TPM 2.0 codecs.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MarshalError {
    #[error("buffer underflow reading {wanted} bytes ({remaining} remaining)")]
    Underflow { wanted: usize, remaining: usize },
    #[error("{0} trailing bytes after structure")]
    TrailingBytes(usize),
    #[error("{0} bytes do not fit a {1}-bit size field")]
    TooLong(usize, u32),
    #[error("unexpected {field}: {value:#x}")]
    Unexpected { field: &'static str, value: u64 },
}

pub type Result<T, E = MarshalError> = core::result::Result<T, E>;

/// Buffer for building TPM structures
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data)
    pub fn put_tpm2b(&mut self, data: &[u8]) -> Result<()> {
        let size = u16::try_from(data.len()).map_err(|_| MarshalError::TooLong(data.len(), 16))?;
        self.put_u16(size);
        self.put_bytes(data);
        Ok(())
    }

    /// Put a TPM 1.2 sized buffer (4-byte size prefix + data)
    pub fn put_sized_u32(&mut self, data: &[u8]) -> Result<()> {
        let size = u32::try_from(data.len()).map_err(|_| MarshalError::TooLong(data.len(), 32))?;
        self.put_u32(size);
        self.put_bytes(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor for parsing TPM structures
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(MarshalError::Underflow {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get a TPM 1.2 sized buffer (4-byte size prefix + data)
    pub fn get_sized_u32(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u32()? as usize;
        self.get_bytes(size)
    }

    pub fn get_remaining(&mut self) -> &'a [u8] {
        let v = &self.data[self.pos..];
        self.pos = self.data.len();
        v
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(MarshalError::TrailingBytes(n)),
        }
    }

    /// Reads a u16 and fails unless it equals `expected`.
    pub fn expect_u16(&mut self, field: &'static str, expected: u16) -> Result<()> {
        let value = self.get_u16()?;
        if value != expected {
            return Err(MarshalError::Unexpected {
                field,
                value: value.into(),
            });
        }
        Ok(())
    }

    pub fn expect_u32(&mut self, field: &'static str, expected: u32) -> Result<()> {
        let value = self.get_u32()?;
        if value != expected {
            return Err(MarshalError::Unexpected {
                field,
                value: value.into(),
            });
        }
        Ok(())
    }
}

/// Types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut Writer) -> Result<()>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Writer::new();
        self.marshal(&mut buf)?;
        Ok(buf.into_vec())
    }
}

/// Types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut Reader) -> Result<Self>;

    /// Parses a complete structure; trailing bytes are an error.
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = Reader::new(data);
        let value = Self::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(value)
    }
}
