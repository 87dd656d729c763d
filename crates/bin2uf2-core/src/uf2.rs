use static_assertions::const_assert;
use std::mem;
use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

pub const UF2_MAGIC_START0: u32 = 0x0A324655;
pub const UF2_MAGIC_START1: u32 = 0x9E5D5157;
pub const UF2_MAGIC_END: u32 = 0x0AB16F30;

pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x00002000;

pub const UF2_BLOCK_SIZE: usize = 512;
pub const UF2_DATA_SIZE: usize = 476;

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
pub struct Uf2BlockHeader {
    pub magic_start0: U32,
    pub magic_start1: U32,
    pub flags: U32,
    pub target_addr: U32,
    pub payload_size: U32,
    pub block_no: U32,
    pub num_blocks: U32,
    pub family_id: U32,
}

pub type Uf2BlockData = [u8; UF2_DATA_SIZE];

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
pub struct Uf2BlockFooter {
    pub magic_end: U32,
}

/// One complete 512 byte UF2 block, laid out exactly as it appears on disk.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
pub struct Uf2Block {
    pub header: Uf2BlockHeader,
    pub data: Uf2BlockData,
    pub footer: Uf2BlockFooter,
}

const_assert!(mem::size_of::<Uf2BlockHeader>() == 32);
const_assert!(mem::size_of::<Uf2BlockFooter>() == 4);
const_assert!(mem::size_of::<Uf2Block>() == UF2_BLOCK_SIZE);

impl Uf2Block {
    /// Builds the first block of a file with `num_blocks` blocks targeting `family_id`.
    ///
    /// The address, block number and data are left zeroed for the caller to fill in.
    pub fn prototype(num_blocks: u32, family_id: u32, payload_size: u32) -> Self {
        Self {
            header: Uf2BlockHeader {
                magic_start0: U32::new(UF2_MAGIC_START0),
                magic_start1: U32::new(UF2_MAGIC_START1),
                flags: U32::new(UF2_FLAG_FAMILY_ID_PRESENT),
                target_addr: U32::new(0),
                payload_size: U32::new(payload_size),
                block_no: U32::new(0),
                num_blocks: U32::new(num_blocks),
                family_id: U32::new(family_id),
            },
            data: [0; UF2_DATA_SIZE],
            footer: Uf2BlockFooter {
                magic_end: U32::new(UF2_MAGIC_END),
            },
        }
    }

    pub fn has_valid_magic(&self) -> bool {
        self.header.magic_start0.get() == UF2_MAGIC_START0
            && self.header.magic_start1.get() == UF2_MAGIC_START1
            && self.footer.magic_end.get() == UF2_MAGIC_END
    }

    /// The bytes of the data area covered by `payload_size`, capped to the data area.
    pub fn payload(&self) -> &[u8] {
        let len = (self.header.payload_size.get() as usize).min(UF2_DATA_SIZE);
        &self.data[..len]
    }
}
