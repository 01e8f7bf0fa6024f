//! The linked, loadable image produced by the linker and consumed by the CPU.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::ContainerError;

pub const MAGIC: &[u8; 8] = b"CSX64exe";
pub const VERSION: u64 = 1;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Executable {
    pub text_len: u64,
    pub rodata_len: u64,
    pub data_len: u64,
    pub bss_len: u64,
    /// `text || rodata || data`, in that order. BSS is not stored; it is lazily
    /// zero-filled at load time.
    pub content: Vec<u8>,
}

impl Executable {
    pub fn new(
        text_len: u64,
        rodata_len: u64,
        data_len: u64,
        bss_len: u64,
        content: Vec<u8>,
    ) -> Result<Executable, ContainerError> {
        let exe = Executable {
            text_len,
            rodata_len,
            data_len,
            bss_len,
            content,
        };
        exe.total_size()?;
        if exe.content.len() as u64 != text_len + rodata_len + data_len {
            return Err(ContainerError::Corrupt(
                "content length does not match segment lengths".to_string(),
            ));
        }
        Ok(exe)
    }

    /// Sum of all four segment lengths; must not overflow the machine word.
    pub fn total_size(&self) -> Result<u64, ContainerError> {
        self.text_len
            .checked_add(self.rodata_len)
            .and_then(|v| v.checked_add(self.data_len))
            .and_then(|v| v.checked_add(self.bss_len))
            .ok_or_else(|| ContainerError::Corrupt("executable size overflows u64".to_string()))
    }

    pub fn text(&self) -> &[u8] {
        &self.content[..self.text_len as usize]
    }

    pub fn rodata(&self) -> &[u8] {
        let start = self.text_len as usize;
        &self.content[start..start + self.rodata_len as usize]
    }

    pub fn data(&self) -> &[u8] {
        let start = (self.text_len + self.rodata_len) as usize;
        &self.content[start..start + self.data_len as usize]
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), ContainerError> {
        self.total_size()?;
        w.write_all(MAGIC)?;
        w.write_u64::<LittleEndian>(VERSION)?;
        w.write_u64::<LittleEndian>(self.text_len)?;
        w.write_u64::<LittleEndian>(self.rodata_len)?;
        w.write_u64::<LittleEndian>(self.data_len)?;
        w.write_u64::<LittleEndian>(self.bss_len)?;
        w.write_all(&self.content)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Executable, ContainerError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ContainerError::TypeMismatch);
        }
        let version = r.read_u64::<LittleEndian>()?;
        if version != VERSION {
            return Err(ContainerError::VersionMismatch {
                found: version,
                expected: VERSION,
            });
        }
        let text_len = r.read_u64::<LittleEndian>()?;
        let rodata_len = r.read_u64::<LittleEndian>()?;
        let data_len = r.read_u64::<LittleEndian>()?;
        let bss_len = r.read_u64::<LittleEndian>()?;

        let mut content = Vec::new();
        r.read_to_end(&mut content)?;

        Executable::new(text_len, rodata_len, data_len, bss_len, content)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_through_binary_serialization() {
        let exe = Executable::new(2, 3, 1, 8, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let mut buf = Vec::new();
        exe.write_to(&mut buf).unwrap();
        let read_back = Executable::read_from(&mut &buf[..]).unwrap();
        assert_eq!(exe, read_back);
        assert_eq!(read_back.text(), &[1, 2]);
        assert_eq!(read_back.rodata(), &[3, 4, 5]);
        assert_eq!(read_back.data(), &[6]);
    }

    #[test]
    fn rejects_mismatched_content_length() {
        assert!(Executable::new(2, 2, 2, 0, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&99u64.to_le_bytes());
        buf.extend_from_slice(&[0u8; 32]);
        assert_eq!(
            Executable::read_from(&mut &buf[..]),
            Err(ContainerError::VersionMismatch { found: 99, expected: VERSION })
        );
    }
}
