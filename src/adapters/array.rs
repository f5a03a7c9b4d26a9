// Chunked binary array storage: one little-endian, C-order file per chunk
// under a directory. This is the writable default for the array family and
// the reference implementation of the array adapter contract.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::ops::Range;
use std::path::{Path, PathBuf};

use super::{AdapterCore, ArrayAdapter, Asset};
use crate::errors::{Result, TreeError};
use crate::structures::{ArrayStructure, Spec, Structure, StructureFamily};

pub const BLOCKS_MIMETYPE: &str = "application/x-blocks";

#[derive(Debug)]
pub struct BlocksAdapter {
    directory: PathBuf,
    structure: ArrayStructure,
    metadata: JsonValue,
    specs: Vec<Spec>,
    writable: bool,
}

impl BlocksAdapter {
    pub fn new(
        directory: PathBuf,
        structure: ArrayStructure,
        metadata: JsonValue,
        specs: Vec<Spec>,
        writable: bool,
    ) -> Result<Self> {
        structure.validate()?;
        Ok(Self {
            directory,
            structure,
            metadata,
            specs,
            writable,
        })
    }

    /// Create the on-disk layout for a new array: a directory containing
    /// one zero-filled file per chunk. Returns the created assets.
    pub fn init_storage(directory: &Path, structure: &ArrayStructure) -> Result<Vec<Asset>> {
        structure.validate()?;
        std::fs::create_dir_all(directory).map_err(|e| {
            TreeError::Internal(anyhow::anyhow!(
                "failed to create array storage at {}: {e}",
                directory.display()
            ))
        })?;
        let itemsize = structure.data_type.itemsize() as u64;
        for block in iter_blocks(&structure.block_counts()) {
            let nbytes = structure
                .block_len(&block)
                .ok_or_else(|| TreeError::Unprocessable("invalid chunk layout".into()))?
                * itemsize;
            let path = directory.join(block_file_name(&block));
            std::fs::write(&path, vec![0u8; nbytes as usize]).map_err(|e| {
                TreeError::Internal(anyhow::anyhow!(
                    "failed to initialize chunk {}: {e}",
                    path.display()
                ))
            })?;
        }
        Ok(vec![Asset {
            data_uri: format!("file://localhost{}", directory.display()),
            is_directory: true,
        }])
    }

    fn block_path(&self, block: &[usize]) -> PathBuf {
        self.directory.join(block_file_name(block))
    }

    fn check_block(&self, block: &[usize]) -> Result<Vec<u64>> {
        self.structure
            .block_shape(block)
            .ok_or_else(|| TreeError::Unprocessable("Block index out of range".into()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(TreeError::Forbidden(
                "this array is externally managed and read-only".into(),
            ))
        }
    }
}

impl AdapterCore for BlocksAdapter {
    fn structure_family(&self) -> StructureFamily {
        StructureFamily::Array
    }

    fn metadata(&self) -> JsonValue {
        self.metadata.clone()
    }

    fn structure(&self) -> Structure {
        Structure::Array(self.structure.clone())
    }

    fn specs(&self) -> Vec<Spec> {
        self.specs.clone()
    }
}

#[async_trait]
impl ArrayAdapter for BlocksAdapter {
    async fn read(&self, slice: Option<&[Range<u64>]>) -> Result<Bytes> {
        let itemsize = self.structure.data_type.itemsize();
        let total: u64 = self.structure.shape.iter().product();
        let mut full = vec![0u8; (total as usize) * itemsize];
        for block in iter_blocks(&self.structure.block_counts()) {
            let shape = self.check_block(&block)?;
            let origin = block_origin(&self.structure, &block);
            let data = tokio::fs::read(self.block_path(&block)).await.map_err(|e| {
                TreeError::Internal(anyhow::anyhow!("failed to read chunk: {e}"))
            })?;
            copy_into(
                &mut full,
                &self.structure.shape,
                &origin,
                &data,
                &shape,
                itemsize,
            )?;
        }
        match slice {
            Some(ranges) => {
                let out = extract(&full, &self.structure.shape, ranges, itemsize)?;
                Ok(Bytes::from(out))
            }
            None => Ok(Bytes::from(full)),
        }
    }

    async fn read_block(
        &self,
        block: &[usize],
        slice: Option<&[Range<u64>]>,
    ) -> Result<Bytes> {
        let shape = self.check_block(block)?;
        let itemsize = self.structure.data_type.itemsize();
        let expected: u64 = shape.iter().product::<u64>() * itemsize as u64;
        let data = tokio::fs::read(self.block_path(block)).await.map_err(|e| {
            TreeError::Internal(anyhow::anyhow!("failed to read chunk: {e}"))
        })?;
        if data.len() as u64 != expected {
            return Err(TreeError::Internal(anyhow::anyhow!(
                "chunk file has {} bytes, expected {expected}",
                data.len()
            )));
        }
        match slice {
            Some(ranges) => {
                let out = extract(&data, &shape, ranges, itemsize)?;
                Ok(Bytes::from(out))
            }
            None => Ok(Bytes::from(data)),
        }
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        self.check_writable()?;
        let itemsize = self.structure.data_type.itemsize();
        let total: u64 = self.structure.shape.iter().product();
        if data.len() as u64 != total * itemsize as u64 {
            return Err(TreeError::Unprocessable(format!(
                "payload has {} bytes, array takes {}",
                data.len(),
                total * itemsize as u64
            )));
        }
        for block in iter_blocks(&self.structure.block_counts()) {
            let shape = self.check_block(&block)?;
            let origin = block_origin(&self.structure, &block);
            let ranges: Vec<Range<u64>> = origin
                .iter()
                .zip(shape.iter())
                .map(|(o, s)| *o..*o + *s)
                .collect();
            let chunk = extract(&data, &self.structure.shape, &ranges, itemsize)?;
            tokio::fs::write(self.block_path(&block), chunk)
                .await
                .map_err(|e| TreeError::Internal(anyhow::anyhow!("failed to write chunk: {e}")))?;
        }
        Ok(())
    }

    async fn write_block(&self, block: &[usize], data: Bytes) -> Result<()> {
        self.check_writable()?;
        let shape = self.check_block(block)?;
        let itemsize = self.structure.data_type.itemsize() as u64;
        let expected: u64 = shape.iter().product::<u64>() * itemsize;
        if data.len() as u64 != expected {
            return Err(TreeError::Unprocessable(format!(
                "payload has {} bytes, block takes {expected}",
                data.len()
            )));
        }
        tokio::fs::write(self.block_path(block), &data)
            .await
            .map_err(|e| TreeError::Internal(anyhow::anyhow!("failed to write chunk: {e}")))?;
        Ok(())
    }
}

fn block_file_name(block: &[usize]) -> String {
    let joined = block
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(".");
    if joined.is_empty() {
        "block-0.bin".to_string()
    } else {
        format!("block-{joined}.bin")
    }
}

/// All per-dimension block indices, in C order.
fn iter_blocks(counts: &[usize]) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new()];
    for count in counts {
        let mut next = Vec::with_capacity(out.len() * count);
        for prefix in &out {
            for i in 0..*count {
                let mut item = prefix.clone();
                item.push(i);
                next.push(item);
            }
        }
        out = next;
    }
    out
}

fn block_origin(structure: &ArrayStructure, block: &[usize]) -> Vec<u64> {
    structure
        .chunks
        .iter()
        .zip(block.iter())
        .map(|(extents, index)| extents[..*index].iter().sum())
        .collect()
}

fn strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Copy a C-order `src` region of shape `src_shape` into the C-order `dst`
/// buffer of shape `dst_shape`, positioned at `origin`.
fn copy_into(
    dst: &mut [u8],
    dst_shape: &[u64],
    origin: &[u64],
    src: &[u8],
    src_shape: &[u64],
    itemsize: usize,
) -> Result<()> {
    let rank = dst_shape.len();
    if rank == 0 {
        dst[..itemsize].copy_from_slice(&src[..itemsize]);
        return Ok(());
    }
    let dst_strides = strides(dst_shape);
    let run = src_shape[rank - 1] as usize * itemsize;
    let rows: u64 = src_shape[..rank - 1].iter().product();
    let mut index = vec![0u64; rank.saturating_sub(1)];
    for row in 0..rows {
        let mut dst_offset = origin[rank - 1] * dst_strides[rank - 1];
        for d in 0..rank - 1 {
            dst_offset += (origin[d] + index[d]) * dst_strides[d];
        }
        let dst_start = dst_offset as usize * itemsize;
        let src_start = row as usize * run;
        dst[dst_start..dst_start + run].copy_from_slice(&src[src_start..src_start + run]);
        // Odometer increment over the leading dimensions.
        for d in (0..rank - 1).rev() {
            index[d] += 1;
            if index[d] < src_shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    Ok(())
}

/// Extract `ranges` from a C-order buffer of the given shape.
pub(crate) fn extract(
    src: &[u8],
    shape: &[u64],
    ranges: &[Range<u64>],
    itemsize: usize,
) -> Result<Vec<u8>> {
    if ranges.len() != shape.len() {
        return Err(TreeError::Unprocessable(format!(
            "slice rank {} does not match array rank {}",
            ranges.len(),
            shape.len()
        )));
    }
    for (range, extent) in ranges.iter().zip(shape.iter()) {
        if range.start > range.end || range.end > *extent {
            return Err(TreeError::Unprocessable(format!(
                "slice {}:{} out of bounds for extent {extent}",
                range.start, range.end
            )));
        }
    }
    let rank = shape.len();
    if rank == 0 {
        return Ok(src[..itemsize].to_vec());
    }
    let src_strides = strides(shape);
    let out_shape: Vec<u64> = ranges.iter().map(|r| r.end - r.start).collect();
    let run = out_shape[rank - 1] as usize * itemsize;
    let rows: u64 = out_shape[..rank - 1].iter().product();
    let mut out = vec![0u8; rows as usize * run];
    let mut index = vec![0u64; rank.saturating_sub(1)];
    for row in 0..rows {
        let mut src_offset = ranges[rank - 1].start * src_strides[rank - 1];
        for d in 0..rank - 1 {
            src_offset += (ranges[d].start + index[d]) * src_strides[d];
        }
        let src_start = src_offset as usize * itemsize;
        let dst_start = row as usize * run;
        out[dst_start..dst_start + run].copy_from_slice(&src[src_start..src_start + run]);
        for d in (0..rank - 1).rev() {
            index[d] += 1;
            if index[d] < out_shape[d] {
                break;
            }
            index[d] = 0;
        }
    }
    Ok(out)
}
