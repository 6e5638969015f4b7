//! Binary framing for key and ciphertext artifacts.
//!
//! Flat little-endian fields with length prefixes, stable across versions:
//! readers reject unknown magics and future format versions instead of
//! guessing. Header fields are deliberately readable without touching the
//! payload so inspection never needs key material.

use std::fs;
use std::path::Path;

use rand::RngCore;

use crate::backend::Ciphertext;
use crate::error::{HeError, HeResult};
use crate::profile::ProfileId;

pub const KEY_MAGIC: &[u8; 4] = b"CSK1";
pub const CIPHERTEXT_MAGIC: &[u8; 4] = b"CSC1";
pub const RESULT_MAGIC: &[u8; 4] = b"CSR1";
pub const FORMAT_VERSION: u16 = 1;

/// Sanity cap on any length prefix, to bound allocations on corrupt input.
const MAX_FIELD_LEN: u64 = 1 << 32;

/// Sequential reader over an in-memory artifact.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> HeResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(HeError::corrupt_artifact(format!(
                "truncated artifact: wanted {n} bytes at offset {}, {} available",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn magic(&mut self, expected: &[u8; 4]) -> HeResult<()> {
        let got = self.take(4)?;
        if got != expected {
            return Err(HeError::corrupt_artifact(format!(
                "bad magic {:02x?}, expected {:02x?}",
                got, expected
            )));
        }
        Ok(())
    }

    pub fn version(&mut self) -> HeResult<u16> {
        let v = self.u16()?;
        if v != FORMAT_VERSION {
            return Err(HeError::corrupt_artifact(format!(
                "unsupported format version {v}"
            )));
        }
        Ok(v)
    }

    pub fn u8(&mut self) -> HeResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> HeResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> HeResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> HeResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn f64(&mut self) -> HeResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub fn string(&mut self) -> HeResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| HeError::corrupt_artifact("non-utf8 string field"))
    }

    pub fn bytes(&mut self) -> HeResult<Vec<u8>> {
        let len = self.u64()?;
        if len > MAX_FIELD_LEN {
            return Err(HeError::corrupt_artifact(format!(
                "length prefix {len} exceeds sanity cap"
            )));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// In-memory artifact writer; the finished buffer goes through
/// [`atomic_write`].
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(magic: &[u8; 4]) -> Self {
        let mut w = Self { buf: Vec::new() };
        w.buf.extend_from_slice(magic);
        w.u16(FORMAT_VERSION);
        w
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }

    pub fn string(&mut self, s: &str) -> HeResult<()> {
        if s.len() > u16::MAX as usize {
            return Err(HeError::OversizeField {
                len: s.len(),
                limit: u16::MAX as usize,
            });
        }
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn bytes(&mut self, b: &[u8]) {
        self.u64(b.len() as u64);
        self.buf.extend_from_slice(b);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Write `bytes` to `path` via a same-directory temp file and rename, so a
/// concurrent reader sees either the previous complete artifact or the new
/// one, never a partial write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> HeResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = dir.join(format!(".{name}.tmp-{:08x}", rand::thread_rng().next_u32()));
    fs::write(&tmp, bytes).map_err(|e| HeError::io(format!("writing {}", tmp.display()), e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(HeError::io(
            format!("publishing {}", path.display()),
            e,
        ));
    }
    Ok(())
}

/// Public header fields of a serialized ciphertext, readable without keys.
#[derive(Clone, Debug, PartialEq)]
pub struct CiphertextHeader {
    pub profile: String,
    pub key_id: String,
    pub level: u32,
    pub scale: f64,
    pub slot_count: u64,
}

pub fn ciphertext_to_bytes(ct: &Ciphertext) -> HeResult<Vec<u8>> {
    let mut w = Writer::new(CIPHERTEXT_MAGIC);
    w.string(&ct.profile.to_string())?;
    w.string(&ct.key_id)?;
    w.u32(ct.level as u32);
    w.f64(ct.scale);
    w.u64(ct.payload.len() as u64);
    for v in &ct.payload {
        w.f64(*v);
    }
    Ok(w.finish())
}

fn read_ciphertext_header(r: &mut Reader<'_>) -> HeResult<CiphertextHeader> {
    r.magic(CIPHERTEXT_MAGIC)?;
    r.version()?;
    Ok(CiphertextHeader {
        profile: r.string()?,
        key_id: r.string()?,
        level: r.u32()?,
        scale: r.f64()?,
        slot_count: r.u64()?,
    })
}

/// Parse only the header of a ciphertext blob; the payload is not touched.
pub fn ciphertext_header_from_bytes(bytes: &[u8]) -> HeResult<CiphertextHeader> {
    read_ciphertext_header(&mut Reader::new(bytes))
}

pub fn ciphertext_from_bytes(bytes: &[u8]) -> HeResult<Ciphertext> {
    let mut r = Reader::new(bytes);
    let header = read_ciphertext_header(&mut r)?;
    // checked_mul so an absurd slot count in the header cannot overflow.
    let expected = header.slot_count.checked_mul(8).ok_or_else(|| {
        HeError::corrupt_artifact(format!(
            "slot count {} overflows the payload length",
            header.slot_count
        ))
    })?;
    if r.remaining() as u64 != expected {
        return Err(HeError::corrupt_artifact(format!(
            "ciphertext payload length {} does not match {} slots",
            r.remaining(),
            header.slot_count
        )));
    }
    let slot_count = header.slot_count as usize;
    let mut payload = Vec::with_capacity(slot_count);
    for _ in 0..slot_count {
        payload.push(r.f64()?);
    }
    let profile: ProfileId = header
        .profile
        .parse()
        .map_err(|_| HeError::corrupt_artifact(format!("unregistered profile {:?}", header.profile)))?;
    Ok(Ciphertext {
        profile,
        key_id: header.key_id,
        level: header.level as usize,
        scale: header.scale,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileId;

    fn sample_ct() -> Ciphertext {
        Ciphertext {
            profile: ProfileId::T,
            key_id: "abcd1234".to_string(),
            level: 7,
            scale: 1048576.0,
            payload: vec![1.0, -2.5, 0.0, 3.25, 0.0, 0.0, 0.0, 0.0],
        }
    }

    #[test]
    fn ciphertext_round_trips() {
        let ct = sample_ct();
        let bytes = ciphertext_to_bytes(&ct).unwrap();
        let back = ciphertext_from_bytes(&bytes).unwrap();
        assert_eq!(back.profile, ct.profile);
        assert_eq!(back.key_id, ct.key_id);
        assert_eq!(back.level, ct.level);
        assert_eq!(back.payload, ct.payload);
    }

    #[test]
    fn header_read_stops_before_payload() {
        let ct = sample_ct();
        let bytes = ciphertext_to_bytes(&ct).unwrap();
        let header = ciphertext_header_from_bytes(&bytes).unwrap();
        assert_eq!(header.slot_count, 8);
        assert_eq!(header.profile, "T");
        // Header parsing must also work when the payload is absent.
        let truncated = &bytes[..bytes.len() - 8 * 8];
        assert_eq!(ciphertext_header_from_bytes(truncated).unwrap(), header);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let ct = sample_ct();
        let bytes = ciphertext_to_bytes(&ct).unwrap();
        let err = ciphertext_from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(err.to_string().starts_with("CorruptArtifact"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = ciphertext_from_bytes(b"NOPE....").unwrap_err();
        assert!(err.to_string().starts_with("CorruptArtifact"));
    }

    #[test]
    fn oversize_string_field_is_rejected() {
        let mut w = Writer::new(CIPHERTEXT_MAGIC);
        let huge = "x".repeat(u16::MAX as usize + 1);
        let err = w.string(&huge).unwrap_err();
        assert!(err.to_string().starts_with("OversizeField"));
        // Fields at the limit still encode.
        w.string(&huge[..u16::MAX as usize]).unwrap();
    }

    #[test]
    fn absurd_slot_count_header_is_corrupt_not_a_panic() {
        let mut w = Writer::new(CIPHERTEXT_MAGIC);
        w.string("T").unwrap();
        w.string("abcd1234").unwrap();
        w.u32(7);
        w.f64(1048576.0);
        w.u64(u64::MAX);
        let err = ciphertext_from_bytes(&w.finish()).unwrap_err();
        assert!(err.to_string().starts_with("CorruptArtifact"));
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        // No temp droppings left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
