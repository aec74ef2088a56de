//! Read-only NumPy `.npy` arrays backed by a memory map.
//!
//! Only little-endian `f4`/`f8` C-order arrays are supported, which covers the
//! trajectory dumps the trainer consumes. Rows are paged in on access.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{JepaError, JepaResult};

const MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    F32,
    F64,
}

impl NpyDtype {
    fn parse(descr: &str) -> JepaResult<Self> {
        match descr {
            "<f4" | "=f4" => Ok(Self::F32),
            "<f8" | "=f8" => Ok(Self::F64),
            other => Err(JepaError::data(format!(
                "unsupported npy dtype {other:?} (expected little-endian f4 or f8)"
            ))),
        }
    }

    pub fn size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Parsed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: NpyDtype,
    pub shape: Vec<usize>,
    /// Byte offset of the first element.
    pub data_offset: usize,
}

fn header_value<'a>(header: &'a str, key: &str) -> JepaResult<&'a str> {
    let pattern = format!("'{key}':");
    let start = header
        .find(&pattern)
        .ok_or_else(|| JepaError::data(format!("npy header has no {key:?} entry")))?;
    Ok(header[start + pattern.len()..].trim_start())
}

fn parse_shape(value: &str) -> JepaResult<Vec<usize>> {
    let inner = value
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(inner, _)| inner)
        .ok_or_else(|| JepaError::data("npy shape is not a tuple"))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| JepaError::data(format!("bad npy dimension {part:?}")))
        })
        .collect()
}

/// Parse the magic, version and header dict at the start of `bytes`.
pub fn parse_header(bytes: &[u8]) -> JepaResult<NpyHeader> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(JepaError::data("not an npy file (bad magic)"));
    }
    let (len, start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(JepaError::data("truncated npy header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(JepaError::data(format!("unsupported npy version {v}"))),
    };
    let end = start + len;
    let raw = bytes
        .get(start..end)
        .ok_or_else(|| JepaError::data("truncated npy header"))?;
    let header = std::str::from_utf8(raw).map_err(|_| JepaError::data("npy header is not utf-8"))?;

    let descr = header_value(header, "descr")?;
    let descr = descr
        .strip_prefix('\'')
        .and_then(|rest| rest.split_once('\''))
        .map(|(d, _)| d)
        .ok_or_else(|| JepaError::data("npy descr is not a string"))?;
    let dtype = NpyDtype::parse(descr)?;

    if header_value(header, "fortran_order")?.starts_with("True") {
        return Err(JepaError::data("fortran-ordered npy arrays are not supported"));
    }
    let shape = parse_shape(header_value(header, "shape")?)?;

    Ok(NpyHeader {
        dtype,
        shape,
        data_offset: end,
    })
}

/// A memory-mapped npy array, indexed by its leading dimension.
pub struct NpyArray {
    path: PathBuf,
    mmap: Mmap,
    header: NpyHeader,
}

impl NpyArray {
    pub fn open(path: impl AsRef<Path>) -> JepaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: the map is read-only and the file is not modified while open.
        let mmap = unsafe { Mmap::map(&file)? };
        let header = parse_header(&mmap)
            .map_err(|e| JepaError::data(format!("{}: {e}", path.display())))?;
        if header.shape.is_empty() {
            return Err(JepaError::data(format!("{}: scalar npy arrays have no rows", path.display())));
        }
        let expected = header
            .shape
            .iter()
            .try_fold(header.dtype.size(), |bytes, &dim| bytes.checked_mul(dim))
            .and_then(|bytes| bytes.checked_add(header.data_offset))
            .ok_or_else(|| {
                JepaError::data(format!(
                    "{}: shape {:?} overflows the addressable size",
                    path.display(),
                    header.shape
                ))
            })?;
        if mmap.len() < expected {
            return Err(JepaError::data(format!(
                "{}: file holds {} bytes, header implies {expected}",
                path.display(),
                mmap.len()
            )));
        }
        Ok(Self { path, mmap, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> &[usize] {
        &self.header.shape
    }

    pub fn dtype(&self) -> NpyDtype {
        self.header.dtype
    }

    pub fn rows(&self) -> usize {
        self.header.shape[0]
    }

    /// Elements per row (product of the trailing dims).
    pub fn row_len(&self) -> usize {
        self.header.shape[1..].iter().product()
    }

    /// Append row `index` to `out` as `f32`.
    pub fn extend_row(&self, index: usize, out: &mut Vec<f32>) -> JepaResult<()> {
        if index >= self.rows() {
            return Err(JepaError::data(format!(
                "{}: row {index} out of range ({} rows)",
                self.path.display(),
                self.rows()
            )));
        }
        let size = self.header.dtype.size();
        let row_bytes = self.row_len() * size;
        let start = self.header.data_offset + index * row_bytes;
        let bytes = &self.mmap[start..start + row_bytes];
        match self.header.dtype {
            NpyDtype::F32 => out.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            ),
            NpyDtype::F64 => out.extend(bytes.chunks_exact(8).map(|c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
            })),
        }
        Ok(())
    }
}

/// Write a little-endian `f4` npy (format 1.0).
pub fn write_f32(path: impl AsRef<Path>, shape: &[usize], data: &[f32]) -> JepaResult<()> {
    let count: usize = shape.iter().product();
    if count != data.len() {
        return Err(JepaError::shape_mismatch(
            "npy write",
            format!("{count} elements for shape {shape:?}"),
            data.len().to_string(),
        ));
    }
    let dims = match shape {
        [single] => format!("{single},"),
        _ => shape.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", "),
    };
    let mut header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({dims}), }}");
    // Pad so that magic + version + length + header is a multiple of 64.
    let unpadded = MAGIC.len() + 2 + 2 + header.len() + 1;
    header.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    header.push('\n');

    let mut file = File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&[1, 0])?;
    file.write_all(&(header.len() as u16).to_le_bytes())?;
    file.write_all(header.as_bytes())?;
    for v in data {
        file.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}
