//! Flat initializer buffers, as the VM materializes array and dictionary
//! literals.
//!
//! The stream holds little-endian scalars. Object slots hold a `u32` index
//! into a side table of references, so no addresses are ever encoded.
use crate::{ObjectRef, Primitive, Result, RuntimeError, TypeId};

#[derive(Debug, Default, Clone)]
pub struct InitList {
    bytes: Vec<u8>,
    objects: Vec<Option<ObjectRef>>,
}

impl InitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_i32(&mut self, value: i32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes the low `scalar_size` bytes of `bits`.
    pub fn push_scalar(&mut self, bits: u64, type_id: TypeId) -> &mut Self {
        let size = type_id.scalar_size().unwrap_or(8);
        self.bytes.extend_from_slice(&bits.to_le_bytes()[..size]);
        self
    }

    pub fn push_primitive<T: Primitive>(&mut self, value: T) -> &mut Self {
        self.push_scalar(value.to_bits(), T::TYPE_ID)
    }

    pub fn push_object(&mut self, object: Option<ObjectRef>) -> &mut Self {
        let index = self.objects.len() as u32;
        self.objects.push(object);
        self.push_u32(index)
    }

    /// Length-prefixed UTF-8.
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.push_u32(value.len() as u32);
        self.bytes.extend_from_slice(value.as_bytes());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn reader(&self) -> InitListReader<'_> {
        InitListReader {
            bytes: &self.bytes,
            objects: &self.objects,
            pos: 0,
        }
    }
}

pub struct InitListReader<'a> {
    bytes: &'a [u8],
    objects: &'a [Option<ObjectRef>],
    pos: usize,
}

impl<'a> InitListReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.bytes.len());
        let Some(end) = end else {
            return Err(RuntimeError::MalformedInitList(format!(
                "needed {len} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        };
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_scalar(&mut self, type_id: TypeId) -> Result<u64> {
        let size = type_id.scalar_size().unwrap_or(8);
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(self.take(size)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_object(&mut self) -> Result<Option<ObjectRef>> {
        let index = self.read_u32()? as usize;
        self.objects.get(index).cloned().ok_or_else(|| {
            RuntimeError::MalformedInitList(format!("object index {index} out of range"))
        })
    }

    pub fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map_err(|err| RuntimeError::MalformedInitList(format!("invalid key: {err}")))
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}
