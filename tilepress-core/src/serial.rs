//! Serialized feature records.
//!
//! Each feature becomes one variable-length record in a worker's geometry
//! stream. All integers are LEB128 varints, signed values zigzag-encoded,
//! little-endian for the one fixed-width field (f64 payloads).
//!
//! ## Wire layout
//!
//! ```text
//! layer_id:      varint
//! segment:       varint
//! kind:          u8          geometry kind (1=point, 2=line, 3=polygon)
//! has_id:        u8
//! id:            varint      only if has_id
//! seq:           varint
//! minzoom_hint:  zigzag      per-feature override, -1 = none
//! maxzoom_hint:  zigzag      per-feature override, -1 = none
//! geom_len:      varint      number of draw ops
//! per op:        op u8, then for MoveTo/LineTo
//!                zigzag dx, zigzag dy (delta from the previous
//!                coordinate; the first coordinate is absolute)
//! nattrs:        varint
//! per attribute: key varint (string-pool offset), value tag u8 + payload
//! feature_minzoom: u8        ALWAYS THE LAST BYTE of the record
//! ```
//!
//! The sorter and the drop-policy fixup rewrite `feature_minzoom` by
//! poking the final byte of the record in place; everything in this module
//! must preserve that invariant. [`SerialFeature::to_bytes`] writes the
//! byte last, and a deserialize/re-serialize round trip reproduces every
//! byte except it.

use crate::geometry::{Draw, DrawOp, DrawVec, GeomKind};
use std::io;

// ============================================================================
// Varints
// ============================================================================

/// Append a LEB128 varint.
pub fn put_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(b);
            return;
        }
        buf.push(b | 0x80);
    }
}

/// Read a LEB128 varint, advancing `pos`.
pub fn get_varint(data: &[u8], pos: &mut usize) -> io::Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let b = *data
            .get(*pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated varint"))?;
        *pos += 1;
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint overflow"));
        }
        v |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

/// Zigzag-encode a signed value.
#[inline]
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[inline]
pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn put_svarint(buf: &mut Vec<u8>, v: i64) {
    put_varint(buf, zigzag(v));
}

fn get_svarint(data: &[u8], pos: &mut usize) -> io::Result<i64> {
    Ok(unzigzag(get_varint(data, pos)?))
}

// ============================================================================
// SerialVal
// ============================================================================

/// A typed attribute value. String payloads are string-pool offsets, local
/// to the writing worker until the pool merge assigns base offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SerialVal {
    Double(f64),
    Int(i64),
    UInt(u64),
    /// Offset of a NUL-terminated UTF-8 string in the worker's pool.
    String(u64),
    Bool(bool),
    Null,
    /// Placeholder for an attribute removed by filtering.
    NoSuch,
}

const TAG_DOUBLE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_UINT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_NULL: u8 = 5;
const TAG_NO_SUCH: u8 = 6;

impl SerialVal {
    fn write(&self, buf: &mut Vec<u8>) {
        match *self {
            SerialVal::Double(d) => {
                buf.push(TAG_DOUBLE);
                buf.extend_from_slice(&d.to_le_bytes());
            }
            SerialVal::Int(i) => {
                buf.push(TAG_INT);
                put_svarint(buf, i);
            }
            SerialVal::UInt(u) => {
                buf.push(TAG_UINT);
                put_varint(buf, u);
            }
            SerialVal::String(off) => {
                buf.push(TAG_STRING);
                put_varint(buf, off);
            }
            SerialVal::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(b as u8);
            }
            SerialVal::Null => buf.push(TAG_NULL),
            SerialVal::NoSuch => buf.push(TAG_NO_SUCH),
        }
    }

    fn read(data: &[u8], pos: &mut usize) -> io::Result<Self> {
        let tag = *data
            .get(*pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated value"))?;
        *pos += 1;
        match tag {
            TAG_DOUBLE => {
                let end = *pos + 8;
                let bytes: [u8; 8] = data
                    .get(*pos..end)
                    .ok_or_else(|| {
                        io::Error::new(io::ErrorKind::UnexpectedEof, "truncated double")
                    })?
                    .try_into()
                    .unwrap();
                *pos = end;
                Ok(SerialVal::Double(f64::from_le_bytes(bytes)))
            }
            TAG_INT => Ok(SerialVal::Int(get_svarint(data, pos)?)),
            TAG_UINT => Ok(SerialVal::UInt(get_varint(data, pos)?)),
            TAG_STRING => Ok(SerialVal::String(get_varint(data, pos)?)),
            TAG_BOOL => {
                let b = *data.get(*pos).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated bool")
                })?;
                *pos += 1;
                Ok(SerialVal::Bool(b != 0))
            }
            TAG_NULL => Ok(SerialVal::Null),
            TAG_NO_SUCH => Ok(SerialVal::NoSuch),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid value tag {}", other),
            )),
        }
    }
}

// ============================================================================
// SerialFeature
// ============================================================================

/// Sentinel for an absent per-feature zoom hint.
pub const NO_ZOOM_HINT: i16 = -1;

/// A feature in its pre-serialization form. Immutable once written except
/// for the trailing `feature_minzoom` byte.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialFeature {
    pub layer: u16,
    pub segment: u16,
    pub kind: GeomKind,
    pub id: Option<u64>,
    pub minzoom_hint: i16,
    pub maxzoom_hint: i16,
    pub geometry: DrawVec,
    pub seq: u64,
    /// `(key pool offset, value)` pairs.
    pub attrs: Vec<(u64, SerialVal)>,
    /// Filled in during or after the spatial sort.
    pub feature_minzoom: u8,
}

impl SerialFeature {
    /// Serialize to the wire format. The returned buffer's final byte is
    /// `feature_minzoom`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.geometry.len() * 4);
        put_varint(&mut buf, self.layer as u64);
        put_varint(&mut buf, self.segment as u64);
        buf.push(self.kind.as_u8());
        buf.push(self.id.is_some() as u8);
        if let Some(id) = self.id {
            put_varint(&mut buf, id);
        }
        put_varint(&mut buf, self.seq);
        put_svarint(&mut buf, self.minzoom_hint as i64);
        put_svarint(&mut buf, self.maxzoom_hint as i64);

        put_varint(&mut buf, self.geometry.len() as u64);
        let mut px: i64 = 0;
        let mut py: i64 = 0;
        for d in &self.geometry {
            buf.push(d.op as u8);
            if d.op != DrawOp::ClosePath {
                put_svarint(&mut buf, d.x - px);
                put_svarint(&mut buf, d.y - py);
                px = d.x;
                py = d.y;
            }
        }

        put_varint(&mut buf, self.attrs.len() as u64);
        for (key, val) in &self.attrs {
            put_varint(&mut buf, *key);
            val.write(&mut buf);
        }

        buf.push(self.feature_minzoom);
        buf
    }

    /// Deserialize one record starting at `data[0]`. Returns the feature
    /// and the number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> io::Result<(Self, usize)> {
        let mut pos = 0usize;
        let layer = get_varint(data, &mut pos)? as u16;
        let segment = get_varint(data, &mut pos)? as u16;
        let kind = GeomKind::from_u8(
            *data
                .get(pos)
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated kind"))?,
        )?;
        pos += 1;
        let has_id = *data
            .get(pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated has_id"))?;
        pos += 1;
        let id = if has_id != 0 {
            Some(get_varint(data, &mut pos)?)
        } else {
            None
        };
        let seq = get_varint(data, &mut pos)?;
        let minzoom_hint = get_svarint(data, &mut pos)? as i16;
        let maxzoom_hint = get_svarint(data, &mut pos)? as i16;

        let geom_len = get_varint(data, &mut pos)? as usize;
        let mut geometry = Vec::with_capacity(geom_len);
        let mut px: i64 = 0;
        let mut py: i64 = 0;
        for _ in 0..geom_len {
            let op = DrawOp::from_u8(*data.get(pos).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated draw op")
            })?)?;
            pos += 1;
            if op != DrawOp::ClosePath {
                px += get_svarint(data, &mut pos)?;
                py += get_svarint(data, &mut pos)?;
                geometry.push(Draw::new(op, px, py));
            } else {
                geometry.push(Draw::new(op, 0, 0));
            }
        }

        let nattrs = get_varint(data, &mut pos)? as usize;
        let mut attrs = Vec::with_capacity(nattrs);
        for _ in 0..nattrs {
            let key = get_varint(data, &mut pos)?;
            let val = SerialVal::read(data, &mut pos)?;
            attrs.push((key, val));
        }

        let feature_minzoom = *data
            .get(pos)
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated minzoom"))?;
        pos += 1;

        Ok((
            Self {
                layer,
                segment,
                kind,
                id,
                minzoom_hint,
                maxzoom_hint,
                geometry,
                seq,
                attrs,
                feature_minzoom,
            },
            pos,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================
