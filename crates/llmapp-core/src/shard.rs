//! Safetensors re-sharding.
//!
//! A safetensors file is an 8-byte little-endian header length, a JSON
//! header mapping tensor names to `{dtype, shape, data_offsets}`, then the
//! raw tensor bytes. Re-sharding regroups tensors so no file holds more
//! than a maximum number of tensor bytes, and writes the index that maps
//! each tensor to its shard.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::security::{resolve_in_dir, SecurityError};

pub const SINGLE_FILE: &str = "model.safetensors";
pub const INDEX_FILE: &str = "model.safetensors.index.json";
pub const DEFAULT_MAX_SHARD_SIZE: &str = "2GB";

const METADATA_KEY: &str = "__metadata__";
/// Headers larger than this are rejected as corrupt.
const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("invalid shard size '{0}' (expected e.g. 2GB, 500MB, 1GiB)")]
    InvalidSize(String),

    #[error("invalid safetensors file {path}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("index {path} names a weight file outside its directory")]
    UnsafeIndexEntry {
        path: PathBuf,
        #[source]
        source: SecurityError,
    },

    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ShardError + '_ {
    move |source| ShardError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Parse a size such as `2GB`, `500MB` or `1GiB` into bytes.
///
/// Decimal units (`KB`, `MB`, `GB`, `TB`) are powers of 1000 as the hub
/// uses them; `KiB`, `MiB`, `GiB`, `TiB` are powers of 1024. A bare number
/// is bytes.
pub fn parse_shard_size(s: &str) -> Result<u64, ShardError> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let invalid = || ShardError::InvalidSize(s.to_string());

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1 << 40,
        _ => return Err(invalid()),
    };
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 1.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

/// Group tensor sizes, in order, into shards of at most `max_bytes`.
///
/// A tensor larger than `max_bytes` gets a shard of its own. Returns the
/// indices of the tensors in each shard.
pub fn plan_shards(sizes: &[u64], max_bytes: u64) -> Vec<Vec<usize>> {
    let mut shards: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_size = 0u64;

    for (idx, &size) in sizes.iter().enumerate() {
        if !current.is_empty() && current_size.saturating_add(size) > max_bytes {
            shards.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(idx);
        current_size = current_size.saturating_add(size);
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

/// Shard file name for shard `index` (0-based) of `count`.
pub fn shard_file_name(index: usize, count: usize) -> String {
    if count <= 1 {
        SINGLE_FILE.to_string()
    } else {
        format!("model-{:05}-of-{:05}.safetensors", index + 1, count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<u64>,
    pub data_offsets: [u64; 2],
}

impl TensorInfo {
    /// Bytes between the data offsets, `None` when they are reversed.
    pub fn byte_len(&self) -> Option<u64> {
        self.data_offsets[1].checked_sub(self.data_offsets[0])
    }
}

/// Parsed header of one safetensors file.
#[derive(Debug, Clone)]
pub struct SafetensorsHeader {
    /// Tensors ordered by data offset
    pub tensors: Vec<(String, TensorInfo)>,
    pub metadata: Option<BTreeMap<String, String>>,
    /// Absolute file offset of the first data byte
    pub data_start: u64,
}

impl SafetensorsHeader {
    /// Total tensor bytes. Offsets were validated by [`read_header`], so
    /// every length fits inside the file.
    pub fn data_len(&self) -> u64 {
        self.tensors
            .iter()
            .map(|(_, t)| t.byte_len().unwrap_or(0))
            .sum()
    }
}

pub fn read_header(path: &Path) -> Result<SafetensorsHeader, ShardError> {
    let invalid = |reason: String| ShardError::InvalidHeader {
        path: path.to_path_buf(),
        reason,
    };

    let mut file = File::open(path).map_err(io_err(path))?;
    let file_len = file.metadata().map_err(io_err(path))?.len();

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes).map_err(io_err(path))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_LEN || 8 + header_len > file_len {
        return Err(invalid(format!("header length {} out of range", header_len)));
    }

    let mut raw = vec![0u8; header_len as usize];
    file.read_exact(&mut raw).map_err(io_err(path))?;
    let entries: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;

    let data_start = 8 + header_len;
    let mut metadata = None;
    let mut tensors = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        if name == METADATA_KEY {
            metadata = Some(
                serde_json::from_value(value)
                    .map_err(|e| invalid(format!("metadata: {}", e)))?,
            );
            continue;
        }
        let info: TensorInfo = serde_json::from_value(value)
            .map_err(|e| invalid(format!("tensor {}: {}", name, e)))?;
        let [start, end] = info.data_offsets;
        let in_file = data_start
            .checked_add(end)
            .is_some_and(|file_end| file_end <= file_len);
        if start > end || !in_file {
            return Err(invalid(format!("tensor {} has offsets out of range", name)));
        }
        tensors.push((name, info));
    }
    tensors.sort_by_key(|(_, t)| t.data_offsets[0]);

    Ok(SafetensorsHeader {
        tensors,
        metadata,
        data_start,
    })
}

/// Serialize a header, padded with spaces to an 8-byte boundary.
pub fn encode_header(
    tensors: &[(String, TensorInfo)],
    metadata: Option<&BTreeMap<String, String>>,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut map = serde_json::Map::new();
    if let Some(metadata) = metadata {
        map.insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
    }
    for (name, info) in tensors {
        map.insert(name.clone(), serde_json::to_value(info)?);
    }
    let mut header = serde_json::to_vec(&map)?;
    while header.len() % 8 != 0 {
        header.push(b' ');
    }
    Ok(header)
}

/// Outcome of a re-shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardReport {
    /// Weight files now in the directory, in shard order
    pub files: Vec<String>,
    /// Previous weight files that were replaced
    pub removed: Vec<String>,
    pub total_size: u64,
}

struct SourceTensor {
    name: String,
    info: TensorInfo,
    source: PathBuf,
    absolute_start: u64,
}

#[derive(Deserialize)]
struct IndexFile {
    weight_map: BTreeMap<String, String>,
}

/// A weight file in the model directory.
struct WeightFile {
    name: String,
    path: PathBuf,
}

/// Safetensors weight files currently in `dir`, from the index if present.
///
/// Index entries are untrusted; each must resolve inside `dir`.
fn existing_weight_files(dir: &Path) -> Result<Vec<WeightFile>, ShardError> {
    let index_path = dir.join(INDEX_FILE);
    if index_path.is_file() {
        let raw = std::fs::read(&index_path).map_err(io_err(&index_path))?;
        let index: IndexFile =
            serde_json::from_slice(&raw).map_err(|e| ShardError::InvalidHeader {
                path: index_path.clone(),
                reason: e.to_string(),
            })?;
        let names: BTreeSet<String> = index.weight_map.into_values().collect();
        return names
            .into_iter()
            .map(|name| {
                let path =
                    resolve_in_dir(dir, &name).map_err(|source| ShardError::UnsafeIndexEntry {
                        path: index_path.clone(),
                        source,
                    })?;
                Ok(WeightFile { name, path })
            })
            .collect();
    }
    let single = dir.join(SINGLE_FILE);
    if single.is_file() {
        return Ok(vec![WeightFile {
            name: SINGLE_FILE.to_string(),
            path: single,
        }]);
    }
    Ok(Vec::new())
}

/// Re-shard the safetensors weights in `dir` so no shard holds more than
/// `max_bytes` of tensor data.
///
/// Returns `None` when the directory has no safetensors weights or every
/// existing file is already within the limit. New shards are written to
/// temporary files first; old files are removed only after every shard has
/// been written.
pub fn reshard_dir(dir: &Path, max_bytes: u64) -> Result<Option<ShardReport>, ShardError> {
    let existing = existing_weight_files(dir)?;
    if existing.is_empty() {
        return Ok(None);
    }

    let mut tensors = Vec::new();
    let mut metadata = None;
    let mut oversized = false;
    for weights in &existing {
        let header = read_header(&weights.path)?;
        oversized |= header.data_len() > max_bytes;
        if metadata.is_none() {
            metadata = header.metadata.clone();
        }
        for (name, info) in header.tensors {
            tensors.push(SourceTensor {
                absolute_start: header.data_start + info.data_offsets[0],
                name,
                info,
                source: weights.path.clone(),
            });
        }
    }

    // A file holding a single oversized tensor cannot be split further
    let splittable = tensors.len() > existing.len();
    if !oversized || !splittable {
        debug!("Safetensors weights already within {} bytes per shard", max_bytes);
        return Ok(None);
    }

    let sizes: Vec<u64> = tensors.iter().map(|t| t.info.byte_len().unwrap_or(0)).collect();
    let total_size = sizes
        .iter()
        .try_fold(0u64, |acc, &size| acc.checked_add(size))
        .ok_or_else(|| ShardError::InvalidHeader {
            path: dir.to_path_buf(),
            reason: "total tensor size overflows".into(),
        })?;
    let plan = plan_shards(&sizes, max_bytes);
    let count = plan.len();
    info!(
        "Re-sharding {} tensors ({} bytes) into {} file(s)",
        tensors.len(),
        total_size,
        count
    );

    let mut written = Vec::with_capacity(count);
    let mut weight_map = BTreeMap::new();
    for (idx, members) in plan.iter().enumerate() {
        let file_name = shard_file_name(idx, count);
        let tmp_path = dir.join(format!("{}.tmp", file_name));
        let shard: Vec<&SourceTensor> = members.iter().map(|&i| &tensors[i]).collect();
        write_shard(&tmp_path, &shard, metadata.as_ref())?;
        for tensor in &shard {
            weight_map.insert(tensor.name.clone(), file_name.clone());
        }
        written.push((tmp_path, file_name));
    }

    let index_path = dir.join(INDEX_FILE);
    let index_tmp = dir.join(format!("{}.tmp", INDEX_FILE));
    if count > 1 {
        let index = serde_json::json!({
            "metadata": {"total_size": total_size},
            "weight_map": weight_map,
        });
        let body = serde_json::to_vec_pretty(&index).map_err(|e| ShardError::InvalidHeader {
            path: index_tmp.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&index_tmp, body).map_err(io_err(&index_tmp))?;
    }

    for weights in &existing {
        std::fs::remove_file(&weights.path).map_err(io_err(&weights.path))?;
    }
    if index_path.is_file() {
        std::fs::remove_file(&index_path).map_err(io_err(&index_path))?;
    }
    for (tmp_path, file_name) in &written {
        let final_path = dir.join(file_name);
        std::fs::rename(tmp_path, &final_path).map_err(io_err(&final_path))?;
    }
    if count > 1 {
        std::fs::rename(&index_tmp, &index_path).map_err(io_err(&index_path))?;
    }

    Ok(Some(ShardReport {
        files: written.into_iter().map(|(_, name)| name).collect(),
        removed: existing.into_iter().map(|w| w.name).collect(),
        total_size,
    }))
}

fn write_shard(
    path: &Path,
    tensors: &[&SourceTensor],
    metadata: Option<&BTreeMap<String, String>>,
) -> Result<(), ShardError> {
    let out_of_range = |tensor: &SourceTensor| ShardError::InvalidHeader {
        path: tensor.source.clone(),
        reason: format!("tensor {} has offsets out of range", tensor.name),
    };

    let mut offset = 0u64;
    let mut entries = Vec::with_capacity(tensors.len());
    for tensor in tensors {
        let end = tensor
            .info
            .byte_len()
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| out_of_range(tensor))?;
        entries.push((
            tensor.name.clone(),
            TensorInfo {
                dtype: tensor.info.dtype.clone(),
                shape: tensor.info.shape.clone(),
                data_offsets: [offset, end],
            },
        ));
        offset = end;
    }
    let header = encode_header(&entries, metadata).map_err(|e| ShardError::InvalidHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let file = File::create(path).map_err(io_err(path))?;
    let mut out = BufWriter::new(file);
    out.write_all(&(header.len() as u64).to_le_bytes())
        .map_err(io_err(path))?;
    out.write_all(&header).map_err(io_err(path))?;

    for tensor in tensors {
        let mut source = File::open(&tensor.source).map_err(io_err(&tensor.source))?;
        source
            .seek(SeekFrom::Start(tensor.absolute_start))
            .map_err(io_err(&tensor.source))?;
        let len = tensor.info.byte_len().ok_or_else(|| out_of_range(tensor))?;
        let copied = std::io::copy(&mut source.take(len), &mut out).map_err(io_err(path))?;
        if copied != len {
            return Err(ShardError::InvalidHeader {
                path: tensor.source.clone(),
                reason: format!("tensor {} truncated", tensor.name),
            });
        }
    }
    out.flush().map_err(io_err(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a safetensors file whose tensors are `u8` vectors filled with
    /// their index.
    fn write_model(path: &Path, tensors: &[(&str, usize)]) {
        let mut entries = Vec::new();
        let mut data = Vec::new();
        for (i, (name, len)) in tensors.iter().enumerate() {
            let start = data.len() as u64;
            data.extend(std::iter::repeat(i as u8).take(*len));
            entries.push((
                name.to_string(),
                TensorInfo {
                    dtype: "U8".into(),
                    shape: vec![*len as u64],
                    data_offsets: [start, data.len() as u64],
                },
            ));
        }
        let metadata = BTreeMap::from([("format".to_string(), "pt".to_string())]);
        let header = encode_header(&entries, Some(&metadata)).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(header.len() as u64).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        std::fs::write(path, out).unwrap();
    }

    fn read_tensor(path: &Path, name: &str) -> Vec<u8> {
        let header = read_header(path).unwrap();
        let (_, info) = header.tensors.iter().find(|(n, _)| n == name).unwrap();
        let bytes = std::fs::read(path).unwrap();
        let start = (header.data_start + info.data_offsets[0]) as usize;
        bytes[start..start + info.byte_len().unwrap() as usize].to_vec()
    }

    #[test]
    fn test_parse_shard_size_units() {
        assert_eq!(parse_shard_size("2GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_shard_size("500MB").unwrap(), 500_000_000);
        assert_eq!(parse_shard_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_shard_size("10MiB").unwrap(), 10 << 20);
        assert_eq!(parse_shard_size("1.5GB").unwrap(), 1_500_000_000);
        assert_eq!(parse_shard_size("4096").unwrap(), 4096);
        assert_eq!(parse_shard_size(" 5 kb ").unwrap(), 5_000);
    }

    #[test]
    fn test_parse_shard_size_rejects_garbage() {
        assert!(parse_shard_size("").is_err());
        assert!(parse_shard_size("GB").is_err());
        assert!(parse_shard_size("2XB").is_err());
        assert!(parse_shard_size("0MB").is_err());
    }

    #[test]
    fn test_plan_shards_greedy() {
        assert_eq!(plan_shards(&[4, 4, 4], 8), vec![vec![0, 1], vec![2]]);
        assert_eq!(plan_shards(&[3, 3, 3], 100), vec![vec![0, 1, 2]]);
        assert!(plan_shards(&[], 8).is_empty());
    }

    #[test]
    fn test_plan_shards_oversized_tensor_alone() {
        assert_eq!(plan_shards(&[2, 20, 2], 8), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_shard_file_names() {
        assert_eq!(shard_file_name(0, 1), "model.safetensors");
        assert_eq!(shard_file_name(1, 3), "model-00002-of-00003.safetensors");
    }

    #[test]
    fn test_header_is_aligned() {
        let header = encode_header(
            &[(
                "w".into(),
                TensorInfo {
                    dtype: "F32".into(),
                    shape: vec![1],
                    data_offsets: [0, 4],
                },
            )],
            None,
        )
        .unwrap();
        assert_eq!(header.len() % 8, 0);
    }

    #[test]
    fn test_reshard_splits_and_preserves_data() {
        let dir = TempDir::new().unwrap();
        write_model(&dir.path().join(SINGLE_FILE), &[("a", 6), ("b", 6), ("c", 6)]);

        let report = reshard_dir(dir.path(), 12).unwrap().unwrap();
        assert_eq!(
            report.files,
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
        assert_eq!(report.removed, vec![SINGLE_FILE]);
        assert_eq!(report.total_size, 18);
        assert!(!dir.path().join(SINGLE_FILE).exists());

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(index["metadata"]["total_size"], 18);
        assert_eq!(index["weight_map"]["a"], "model-00001-of-00002.safetensors");
        assert_eq!(index["weight_map"]["c"], "model-00002-of-00002.safetensors");

        let second = dir.path().join("model-00002-of-00002.safetensors");
        assert_eq!(read_tensor(&second, "c"), vec![2u8; 6]);
        let header = read_header(&second).unwrap();
        assert_eq!(header.metadata.unwrap()["format"], "pt");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_reshard_merges_small_shards() {
        let dir = TempDir::new().unwrap();
        write_model(&dir.path().join("model-00001-of-00002.safetensors"), &[("a", 4)]);
        write_model(&dir.path().join("model-00002-of-00002.safetensors"), &[("b", 4), ("c", 8)]);
        std::fs::write(
            dir.path().join(INDEX_FILE),
            serde_json::json!({
                "metadata": {"total_size": 16},
                "weight_map": {
                    "a": "model-00001-of-00002.safetensors",
                    "b": "model-00002-of-00002.safetensors",
                    "c": "model-00002-of-00002.safetensors"
                }
            })
            .to_string(),
        )
        .unwrap();

        let report = reshard_dir(dir.path(), 10).unwrap().unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(read_tensor(&dir.path().join(&report.files[0]), "b"), vec![0u8; 4]);
        assert_eq!(read_tensor(&dir.path().join(&report.files[1]), "c"), vec![1u8; 8]);
    }

    #[test]
    fn test_reshard_within_limit_is_noop() {
        let dir = TempDir::new().unwrap();
        write_model(&dir.path().join(SINGLE_FILE), &[("a", 4), ("b", 4)]);
        assert!(reshard_dir(dir.path(), 1000).unwrap().is_none());
        assert!(dir.path().join(SINGLE_FILE).exists());
    }

    #[test]
    fn test_reshard_without_safetensors() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), b"x").unwrap();
        assert!(reshard_dir(dir.path(), 10).unwrap().is_none());
    }

    #[test]
    fn test_byte_len_rejects_reversed_offsets() {
        let info = TensorInfo {
            dtype: "U8".into(),
            shape: vec![4],
            data_offsets: [8, 4],
        };
        assert_eq!(info.byte_len(), None);
    }

    #[test]
    fn test_read_header_rejects_overflowing_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SINGLE_FILE);
        let header = encode_header(
            &[(
                "w".into(),
                TensorInfo {
                    dtype: "U8".into(),
                    shape: vec![1],
                    data_offsets: [0, u64::MAX],
                },
            )],
            None,
        )
        .unwrap();
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&[0u8; 16]);
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read_header(&path),
            Err(ShardError::InvalidHeader { .. })
        ));
        assert!(matches!(
            reshard_dir(dir.path(), 1),
            Err(ShardError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_reshard_rejects_index_outside_dir() {
        let root = TempDir::new().unwrap();
        let model_dir = root.path().join("model");
        std::fs::create_dir(&model_dir).unwrap();
        let victim = root.path().join("victim.safetensors");
        write_model(&victim, &[("a", 6), ("b", 6)]);
        write_model(&model_dir.join("model-00001-of-00001.safetensors"), &[("c", 6)]);
        std::fs::write(
            model_dir.join(INDEX_FILE),
            serde_json::json!({
                "weight_map": {
                    "a": "../victim.safetensors",
                    "c": "model-00001-of-00001.safetensors"
                }
            })
            .to_string(),
        )
        .unwrap();

        let err = reshard_dir(&model_dir, 4).unwrap_err();
        assert!(matches!(
            err,
            ShardError::UnsafeIndexEntry {
                source: SecurityError::PathTraversal { .. },
                ..
            }
        ));
        assert!(victim.exists());
        assert!(model_dir.join("model-00001-of-00001.safetensors").exists());
    }

    #[test]
    fn test_read_header_rejects_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SINGLE_FILE);
        let mut bytes = 1_000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_header(&path),
            Err(ShardError::InvalidHeader { .. })
        ));
    }
}
