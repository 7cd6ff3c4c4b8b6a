//! Pre-tokenized shard files.
//!
//! A corpus is a directory of shard files. A file belongs to a split when its
//! name contains the split name, and shards are ordered by sorted file name.
//! Two on-disk formats are read: NumPy `.npy` (1-D, C order, `<u2`, `<u4`,
//! `<i4` or `<i8`) and flat little-endian `u32` `.bin` files.

use std::path::{Path, PathBuf};

use super::tokenizer::TextCodec;
use crate::error::{config_error, IoResultExt, TrainError, TrainResult};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Which slice of the corpus a feeder streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Split {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            other => Err(TrainError::Config(format!(
                "unknown split '{}', expected 'train' or 'val'",
                other
            ))),
        }
    }
}

/// List the shard files of a split under `root`, sorted by file name.
///
/// An empty result is a data-availability error.
pub fn list_shards(root: &Path, split: Split) -> TrainResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(root).map_err(|e| {
        TrainError::DataAvailability(format!(
            "cannot read shard directory {}: {}",
            root.display(),
            e
        ))
    })?;

    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.with_path(root)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let supported = name.ends_with(".npy") || name.ends_with(".bin");
        if supported && name.contains(split.as_str()) {
            shards.push(path);
        }
    }
    shards.sort();

    if shards.is_empty() {
        return Err(TrainError::DataAvailability(format!(
            "no shards found for split '{}' in {}",
            split,
            root.display()
        )));
    }
    Ok(shards)
}

/// Load one shard into memory as `u32` token IDs.
pub fn load_tokens(path: &Path) -> TrainResult<Vec<u32>> {
    let data = std::fs::read(path).with_path(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => parse_npy(&data).map_err(|msg| bad_shard(path, &msg)),
        Some("bin") => parse_bin(&data).map_err(|msg| bad_shard(path, &msg)),
        _ => Err(bad_shard(path, "unsupported extension")),
    }
}

fn bad_shard(path: &Path, msg: &str) -> TrainError {
    TrainError::DataAvailability(format!("bad shard {}: {}", path.display(), msg))
}

fn parse_bin(data: &[u8]) -> Result<Vec<u32>, String> {
    if data.len() % 4 != 0 {
        return Err(format!("{} bytes is not a multiple of 4", data.len()));
    }
    Ok(data
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NpyDtype {
    U16,
    U32,
    I32,
    I64,
}

impl NpyDtype {
    fn parse(descr: &str) -> Result<Self, String> {
        match descr {
            "<u2" | "|u2" => Ok(NpyDtype::U16),
            "<u4" => Ok(NpyDtype::U32),
            "<i4" => Ok(NpyDtype::I32),
            "<i8" => Ok(NpyDtype::I64),
            other => Err(format!("unsupported dtype '{}'", other)),
        }
    }

    fn width(&self) -> usize {
        match self {
            NpyDtype::U16 => 2,
            NpyDtype::U32 | NpyDtype::I32 => 4,
            NpyDtype::I64 => 8,
        }
    }
}

/// Pull the quoted or bare value that follows `'key':` in an npy header dict.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{}':", key);
    let start = header.find(&needle)? + needle.len();
    let rest = header[start..].trim_start();
    if let Some(body) = rest.strip_prefix('\'') {
        let end = body.find('\'')?;
        Some(&body[..end])
    } else if let Some(body) = rest.strip_prefix('(') {
        let end = body.find(')')?;
        Some(&body[..end])
    } else {
        let end = rest.find([',', '}']).unwrap_or(rest.len());
        Some(rest[..end].trim())
    }
}

fn parse_npy(data: &[u8]) -> Result<Vec<u32>, String> {
    if data.len() < 10 || &data[..6] != NPY_MAGIC {
        return Err("missing NUMPY magic".to_string());
    }
    let major = data[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([data[8], data[9]]) as usize, 10),
        2 | 3 => {
            if data.len() < 12 {
                return Err("truncated header".to_string());
            }
            (
                u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize,
                12,
            )
        }
        v => return Err(format!("unsupported npy version {}", v)),
    };
    let body_start = header_start + header_len;
    if data.len() < body_start {
        return Err("truncated header".to_string());
    }
    let header = std::str::from_utf8(&data[header_start..body_start])
        .map_err(|_| "header is not utf-8".to_string())?;

    let dtype = NpyDtype::parse(header_value(header, "descr").ok_or("missing descr")?)?;
    if header_value(header, "fortran_order") != Some("False") {
        return Err("fortran order is not supported".to_string());
    }
    let shape = header_value(header, "shape").ok_or("missing shape")?;
    let dims: Vec<usize> = shape
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| format!("bad shape '{}'", shape)))
        .collect::<Result<_, _>>()?;
    if dims.len() != 1 {
        return Err(format!("expected a 1-D array, got shape ({})", shape));
    }
    let count = dims[0];

    let body = &data[body_start..];
    if body.len() != count * dtype.width() {
        return Err(format!(
            "body has {} bytes, expected {} for {} elements",
            body.len(),
            count * dtype.width(),
            count
        ));
    }

    let tokens = match dtype {
        NpyDtype::U16 => body
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
            .collect(),
        NpyDtype::U32 => parse_bin(body)?,
        NpyDtype::I32 => body
            .chunks_exact(4)
            .map(|c| {
                let v = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                u32::try_from(v).map_err(|_| format!("negative token id {}", v))
            })
            .collect::<Result<_, _>>()?,
        NpyDtype::I64 => body
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                let v = i64::from_le_bytes(b);
                u32::try_from(v).map_err(|_| format!("token id {} out of range", v))
            })
            .collect::<Result<_, _>>()?,
    };
    Ok(tokens)
}

/// Write tokens as a version 1.0 `.npy` file of `<u2`.
///
/// GPT-2 token IDs fit in 16 bits; any ID >= 65536 is rejected.
pub fn write_shard(path: &Path, tokens: &[u32]) -> TrainResult<()> {
    let mut header = format!(
        "{{'descr': '<u2', 'fortran_order': False, 'shape': ({},), }}",
        tokens.len()
    );
    // magic(6) + version(2) + len(2) + header + '\n' padded to 64 bytes
    let unpadded = 10 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    header.push_str(&" ".repeat(pad));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + tokens.len() * 2);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for &tok in tokens {
        let t = u16::try_from(tok).map_err(|_| {
            TrainError::DataAvailability(format!("token id {} does not fit in uint16", tok))
        })?;
        out.extend_from_slice(&t.to_le_bytes());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    std::fs::write(path, out).with_path(path)?;
    Ok(())
}

/// Write tokens as a flat little-endian `u32` `.bin` file.
pub fn write_bin_shard(path: &Path, tokens: &[u32]) -> TrainResult<()> {
    let bytes: Vec<u8> = tokens.iter().flat_map(|t| t.to_le_bytes()).collect();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }
    std::fs::write(path, bytes).with_path(path)?;
    Ok(())
}

/// Pack documents into `.npy` shards of exactly `shard_size` tokens (the
/// last one holds the remainder).
///
/// Each document is preceded by the codec's end-of-text token. Shard 0 is
/// written as `val`, the rest as `train`: `<prefix>_<split>_<index:06>.npy`.
pub fn prepare_shards<'a, I>(
    documents: I,
    codec: &dyn TextCodec,
    out_dir: &Path,
    prefix: &str,
    shard_size: usize,
) -> TrainResult<Vec<PathBuf>>
where
    I: IntoIterator<Item = &'a str>,
{
    if shard_size == 0 {
        return Err(config_error("shard_size must be greater than 0"));
    }
    let eot = codec
        .eot_token()
        .ok_or_else(|| TrainError::Tokenizer("tokenizer has no end-of-text token".to_string()))?;

    let mut written = Vec::new();
    let mut flush = |buf: &[u32]| -> TrainResult<()> {
        let split = if written.is_empty() { Split::Val } else { Split::Train };
        let path = out_dir.join(format!("{}_{}_{:06}.npy", prefix, split, written.len()));
        write_shard(&path, buf)?;
        tracing::info!(path = %path.display(), tokens = buf.len(), "Shard written");
        written.push(path);
        Ok(())
    };

    let mut buf: Vec<u32> = Vec::with_capacity(shard_size);
    for doc in documents {
        let mut tokens = vec![eot];
        tokens.extend(codec.encode(doc)?);
        let mut rest = tokens.as_slice();
        while buf.len() + rest.len() >= shard_size {
            let take = shard_size - buf.len();
            buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            flush(&buf)?;
            buf.clear();
        }
        buf.extend_from_slice(rest);
    }
    if !buf.is_empty() {
        flush(&buf)?;
    }
    Ok(written)
}
