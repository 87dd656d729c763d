//! Reading UF2 files back and checking that they are well formed.

use crate::uf2::{Uf2Block, UF2_BLOCK_SIZE, UF2_DATA_SIZE, UF2_FLAG_FAMILY_ID_PRESENT};
use log::trace;
use thiserror::Error;
use zerocopy::FromBytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Summary {
    pub blocks: u32,
    pub flags: u32,
    /// `None` when the family id flag is not set.
    pub family_id: Option<u32>,
    pub first_addr: u32,
    pub last_addr: u32,
    pub payload_bytes: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InspectError {
    #[error("The file contains no blocks")]
    Empty,
    #[error("Block {block} is truncated to {len} bytes")]
    TruncatedBlock { block: usize, len: usize },
    #[error("Block {0} has a bad magic number")]
    BadMagic(usize),
    #[error("Block {block} claims a payload of {size} bytes")]
    PayloadTooLarge { block: usize, size: u32 },
    #[error("Block {block} says the file has {found} blocks, but it has {expected}")]
    BlockCountMismatch {
        block: usize,
        expected: usize,
        found: u32,
    },
    #[error("Block {block} is numbered {found}")]
    BlockNumberMismatch { block: usize, found: u32 },
    #[error("Block {block} has flags {found:#010x}, expected {expected:#010x}")]
    FlagsMismatch {
        block: usize,
        expected: u32,
        found: u32,
    },
    #[error("Block {block} has family id {found:#010x}, expected {expected:#010x}")]
    FamilyMismatch {
        block: usize,
        expected: u32,
        found: u32,
    },
}

/// Splits `bytes` into UF2 blocks. A trailing partial block is reported as an error.
pub fn blocks(bytes: &[u8]) -> impl Iterator<Item = Result<Uf2Block, InspectError>> + '_ {
    bytes
        .chunks(UF2_BLOCK_SIZE)
        .enumerate()
        .map(|(block, chunk)| {
            Uf2Block::read_from_bytes(chunk).map_err(|_| InspectError::TruncatedBlock {
                block,
                len: chunk.len(),
            })
        })
}

/// Checks that every block in `bytes` agrees on the layout of the file and summarizes it.
pub fn inspect(bytes: &[u8]) -> Result<Uf2Summary, InspectError> {
    let total = bytes.len().div_ceil(UF2_BLOCK_SIZE);
    let mut summary: Option<Uf2Summary> = None;

    for (index, block) in blocks(bytes).enumerate() {
        let block = block?;
        let header = &block.header;

        if !block.has_valid_magic() {
            return Err(InspectError::BadMagic(index));
        }

        let payload_size = header.payload_size.get();
        if payload_size as usize > UF2_DATA_SIZE {
            return Err(InspectError::PayloadTooLarge {
                block: index,
                size: payload_size,
            });
        }

        let num_blocks = header.num_blocks.get();
        if num_blocks as usize != total {
            return Err(InspectError::BlockCountMismatch {
                block: index,
                expected: total,
                found: num_blocks,
            });
        }

        let block_no = header.block_no.get();
        if block_no as usize != index {
            return Err(InspectError::BlockNumberMismatch {
                block: index,
                found: block_no,
            });
        }

        let flags = header.flags.get();
        let family_id = header.family_id.get();
        let target_addr = header.target_addr.get();

        trace!(
            "Block {} / {} {:#010x} ({} bytes)",
            block_no,
            num_blocks,
            target_addr,
            payload_size
        );

        match summary.as_mut() {
            None => {
                summary = Some(Uf2Summary {
                    blocks: num_blocks,
                    flags,
                    family_id: (flags & UF2_FLAG_FAMILY_ID_PRESENT != 0).then_some(family_id),
                    first_addr: target_addr,
                    last_addr: target_addr,
                    payload_bytes: payload_size as u64,
                });
            }
            Some(summary) => {
                if flags != summary.flags {
                    return Err(InspectError::FlagsMismatch {
                        block: index,
                        expected: summary.flags,
                        found: flags,
                    });
                }
                if let Some(expected) = summary.family_id {
                    if family_id != expected {
                        return Err(InspectError::FamilyMismatch {
                            block: index,
                            expected,
                            found: family_id,
                        });
                    }
                }
                summary.last_addr = target_addr;
                summary.payload_bytes += payload_size as u64;
            }
        }
    }

    summary.ok_or(InspectError::Empty)
}

/// Concatenates the payload of every block in file order.
pub fn extract_payload(bytes: &[u8]) -> Result<Vec<u8>, InspectError> {
    let mut payload = Vec::with_capacity(bytes.len() / 2);

    for (index, block) in blocks(bytes).enumerate() {
        let block = block?;
        if !block.has_valid_magic() {
            return Err(InspectError::BadMagic(index));
        }
        payload.extend_from_slice(block.payload());
    }

    Ok(payload)
}
