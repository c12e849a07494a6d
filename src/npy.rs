// VecShelf — npy.rs
// NumPy .npy reader for float32 (N, D) embedding matrices.
//
// .npy format (simplified):
//   - Magic:   \x93NUMPY
//   - Version: 1.0 / 2.0
//   - Header:  variable-length dict describing dtype, shape, order
//   - Data:    raw little-endian float32 values (row-major)
//
// Author: d65v <https://github.com/d65v>

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::ShelfError;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Error)]
pub enum NpyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not a .npy file (bad magic bytes)")]
    BadMagic,
    #[error("Unsupported .npy version {0}.{1}")]
    UnsupportedVersion(u8, u8),
    #[error("Header parse error: {0}")]
    Parse(String),
    #[error("Unsupported dtype: {0} (need little-endian float32)")]
    UnsupportedDtype(String),
    #[error("Array must be 2-D (N, D)")]
    WrongShape,
    #[error("Fortran-ordered arrays are not supported")]
    FortranOrder,
}

impl From<NpyError> for ShelfError {
    fn from(e: NpyError) -> Self {
        ShelfError::Source(format!("npy: {}", e))
    }
}

#[derive(Debug, PartialEq)]
struct NpyHeader {
    rows: usize,
    cols: usize,
    is_fortran_order: bool,
}

/// A row-major float32 matrix.
#[derive(Debug, Clone)]
pub struct NpyMatrix {
    pub rows: usize,
    pub cols: usize,
    data: Vec<f32>,
}

impl NpyMatrix {
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        if i >= self.rows {
            return None;
        }
        Some(&self.data[i * self.cols..(i + 1) * self.cols])
    }

    pub fn into_rows(self) -> Vec<Vec<f32>> {
        if self.cols == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data.chunks_exact(self.cols).map(|r| r.to_vec()).collect()
    }
}

/// Parse a minimal .npy v1.0 / v2.0 header. Returns the header and the data offset.
fn parse_npy_header(data: &[u8]) -> Result<(NpyHeader, usize), NpyError> {
    if !data.starts_with(NPY_MAGIC) {
        return Err(NpyError::BadMagic);
    }
    if data.len() < 10 {
        return Err(NpyError::Parse("file too short for preamble".into()));
    }

    let major = data[6];
    let minor = data[7];
    if major == 0 || major > 2 {
        return Err(NpyError::UnsupportedVersion(major, minor));
    }

    // Header length: 2 bytes (v1) or 4 bytes (v2) little-endian
    let (header_len, header_start) = if major == 1 {
        (u16::from_le_bytes([data[8], data[9]]) as usize, 10usize)
    } else {
        if data.len() < 12 {
            return Err(NpyError::Parse("file too short for preamble".into()));
        }
        let len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize;
        (len, 12usize)
    };

    let header_end = header_start + header_len;
    if data.len() < header_end {
        return Err(NpyError::Parse("file too short for declared header".into()));
    }

    let header_str = std::str::from_utf8(&data[header_start..header_end])
        .map_err(|_| NpyError::Parse("header is not valid UTF-8".into()))?;

    let is_le_f32 = header_str.contains("'<f4'") || header_str.contains("\"<f4\"");
    if !is_le_f32 {
        let dtype = header_str
            .split("'descr':")
            .nth(1)
            .unwrap_or("unknown")
            .trim()
            .trim_start_matches([' ', '\'', '"'])
            .chars()
            .take(8)
            .collect::<String>();
        return Err(NpyError::UnsupportedDtype(dtype));
    }

    let is_fortran_order = header_str.contains("'fortran_order': True")
        || header_str.contains("\"fortran_order\": True");

    // Extract shape: 'shape': (N, D)
    let shape_start = header_str
        .find("'shape':")
        .or_else(|| header_str.find("\"shape\":"))
        .ok_or_else(|| NpyError::Parse("no 'shape' key".into()))?;
    let after_shape = &header_str[shape_start..];
    let paren_start = after_shape
        .find('(')
        .ok_or_else(|| NpyError::Parse("no '(' after shape".into()))?;
    let paren_end = after_shape
        .find(')')
        .ok_or_else(|| NpyError::Parse("no ')' after shape".into()))?;

    let dims: Vec<usize> = after_shape[paren_start + 1..paren_end]
        .split(',')
        .filter_map(|s| s.trim().parse::<usize>().ok())
        .collect();
    if dims.len() != 2 {
        return Err(NpyError::WrongShape);
    }

    Ok((
        NpyHeader {
            rows: dims[0],
            cols: dims[1],
            is_fortran_order,
        },
        header_end,
    ))
}

/// Decode a whole .npy buffer.
pub fn decode_npy(raw: &[u8]) -> Result<NpyMatrix, NpyError> {
    let (header, offset) = parse_npy_header(raw)?;
    if header.is_fortran_order {
        return Err(NpyError::FortranOrder);
    }

    let expected_bytes = header.rows * header.cols * 4;
    let available = raw.len() - offset;
    if available < expected_bytes {
        return Err(NpyError::Parse(format!(
            "data section too small: expected {} bytes, got {}",
            expected_bytes, available
        )));
    }

    let data = raw[offset..offset + expected_bytes]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(NpyMatrix {
        rows: header.rows,
        cols: header.cols,
        data,
    })
}

/// Read a float32 (N, D) matrix from disk.
pub fn read_npy(path: impl AsRef<Path>) -> Result<NpyMatrix, NpyError> {
    let raw = fs::read(path.as_ref())?;
    let matrix = decode_npy(&raw)?;
    log::debug!(
        "npy: {} → shape ({}, {})",
        path.as_ref().display(),
        matrix.rows,
        matrix.cols
    );
    Ok(matrix)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
