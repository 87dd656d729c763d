//! This is the backend library logic for bin2uf2.
//!
//! It turns a raw firmware image (the bytes that should end up in flash,
//! starting at a known base address) into a UF2 file that a bootloader
//! exposing a USB mass storage drive will accept.

use crate::{
    reporter::{NoProgress, ProgressReporter},
    uf2::{Uf2Block, UF2_BLOCK_SIZE},
};
use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use assert_into::AssertInto;
use log::*;
use thiserror::Error;
use zerocopy::{little_endian::U32, IntoBytes};

pub mod inspect;
pub mod reporter;
pub mod uf2;

pub const LOG2_PAGE_SIZE: u32 = 8;
pub const PAGE_SIZE: u32 = 1 << LOG2_PAGE_SIZE;

/// Start of the XIP flash window on the RP2xxx parts, where images are placed by default.
pub const FLASH_START: u32 = 0x10000000;

// See https://github.com/microsoft/uf2/blob/master/utils/uf2families.json for list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum Family {
    /// Raspberry Pi RP2040
    RP2040 = 0xe48bff56,

    /// Raspberry Pi Microcontrollers: Absolute (unpartitioned) download
    RP2XXX_ABSOLUTE = 0xe48bff57,

    /// Raspberry Pi Microcontrollers: Data partition download
    RP2XXX_DATA = 0xe48bff58,

    /// Raspberry Pi RP2350, Secure Arm image
    RP2350_ARM_S = 0xe48bff59,

    /// Raspberry Pi RP2350, RISC-V image
    RP2350_RISCV = 0xe48bff5a,

    /// Raspberry Pi RP2350, Non-secure Arm image
    RP2350_ARM_NS = 0xe48bff5b,
}

impl Default for Family {
    fn default() -> Self {
        Self::RP2040
    }
}

impl Family {
    pub const ALL: &'static [Family] = &[
        Family::RP2040,
        Family::RP2XXX_ABSOLUTE,
        Family::RP2XXX_DATA,
        Family::RP2350_ARM_S,
        Family::RP2350_RISCV,
        Family::RP2350_ARM_NS,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    /// Short name used on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Family::RP2040 => "rp2040",
            Family::RP2XXX_ABSOLUTE => "rp2xxx-absolute",
            Family::RP2XXX_DATA => "rp2xxx-data",
            Family::RP2350_ARM_S => "rp2350-arm-s",
            Family::RP2350_RISCV => "rp2350-riscv",
            Family::RP2350_ARM_NS => "rp2350-arm-ns",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|family| family.name().eq_ignore_ascii_case(name))
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|family| family.id() == id)
    }
}

/// Where the image is placed and which family the bootloader should accept it for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertOptions {
    pub base_address: u32,
    pub family_id: u32,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            base_address: FLASH_START,
            family_id: Family::default().id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertSummary {
    pub blocks: u32,
    pub payload_bytes: usize,
    pub output: PathBuf,
}

#[derive(Error, Debug)]
pub enum Bin2Uf2Error {
    #[error("Could not find or read input file {}", .path.display())]
    InputNotFound { path: PathBuf, source: io::Error },
    #[error("Failed to read input")]
    FailedToRead(io::Error),
    #[error("The input image is empty")]
    EmptyInput,
    #[error("An image of {len} bytes at {base_address:#010x} does not fit in the 32 bit address space")]
    ImageTooLarge { len: usize, base_address: u32 },
    #[error("Failed to create output file {}", .path.display())]
    FailedToCreate { path: PathBuf, source: io::Error },
    #[error("Failed to write to output")]
    FailedToWrite(io::Error),
}

/// Number of UF2 blocks needed for an image of `len` bytes.
pub fn block_count(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE as usize)
}

/// Checks that the image can be addressed from the base address and returns its block count.
fn check_image(image: &[u8], options: &ConvertOptions) -> Result<u32, Bin2Uf2Error> {
    if image.is_empty() {
        return Err(Bin2Uf2Error::EmptyInput);
    }

    let blocks = block_count(image.len());
    let last_target_addr = options.base_address as u64 + (blocks as u64 - 1) * PAGE_SIZE as u64;

    if last_target_addr > u32::MAX as u64 {
        return Err(Bin2Uf2Error::ImageTooLarge {
            len: image.len(),
            base_address: options.base_address,
        });
    }

    Ok(blocks.assert_into())
}

pub fn read_image<P: AsRef<Path>>(input_path: P) -> Result<Vec<u8>, Bin2Uf2Error> {
    let path = input_path.as_ref();
    fs::read(path).map_err(|source| Bin2Uf2Error::InputNotFound {
        path: path.to_owned(),
        source,
    })
}

/// Writes `image` as a sequence of UF2 blocks and returns the number of blocks written.
///
/// Each block carries `PAGE_SIZE` bytes of the image, the last one zero padded,
/// targeting `options.base_address` plus the offset of the chunk in the image.
/// The output is flushed before returning.
pub fn write_output(
    image: &[u8],
    mut output: impl Write,
    options: &ConvertOptions,
    reporter: &mut dyn ProgressReporter,
) -> Result<u32, Bin2Uf2Error> {
    let num_blocks = check_image(image, options)?;

    let mut block = Uf2Block::prototype(num_blocks, options.family_id, PAGE_SIZE);

    reporter.start(num_blocks as usize * UF2_BLOCK_SIZE);

    for (block_no, chunk) in image.chunks(PAGE_SIZE as usize).enumerate() {
        let block_no: u32 = block_no.assert_into();
        let target_addr = options.base_address + block_no * PAGE_SIZE;

        block.header.target_addr = U32::new(target_addr);
        block.header.block_no = U32::new(block_no);

        debug!("Block {} / {} {:#010x}", block_no, num_blocks, target_addr);

        block.data.fill(0);
        block.data[..chunk.len()].copy_from_slice(chunk);

        output
            .write_all(block.as_bytes())
            .map_err(Bin2Uf2Error::FailedToWrite)?;

        reporter.advance(UF2_BLOCK_SIZE);
    }

    output.flush().map_err(Bin2Uf2Error::FailedToWrite)?;

    Ok(num_blocks)
}

/// Converts a raw binary read from `input` into a uf2 stream on `output`.
pub fn bin2uf2(
    mut input: impl Read,
    output: impl Write,
    options: &ConvertOptions,
) -> Result<u32, Bin2Uf2Error> {
    let mut image = Vec::new();
    input
        .read_to_end(&mut image)
        .map_err(Bin2Uf2Error::FailedToRead)?;

    write_output(&image, output, options, &mut NoProgress)
}

/// Converts the binary file at `input_path` into a uf2 file at `output_path`.
///
/// The input is read and validated before the output is created, so a missing or
/// unusable input never leaves an output file behind. If writing fails part way the
/// partial output is removed.
pub fn convert<P1: AsRef<Path>, P2: AsRef<Path>>(
    input_path: P1,
    output_path: P2,
    options: &ConvertOptions,
    reporter: &mut dyn ProgressReporter,
) -> Result<ConvertSummary, Bin2Uf2Error> {
    let output_path = output_path.as_ref();

    let image = read_image(input_path)?;
    check_image(&image, options)?;

    let output = File::create(output_path).map_err(|source| Bin2Uf2Error::FailedToCreate {
        path: output_path.to_owned(),
        source,
    })?;

    let blocks = write_file(
        &image,
        BufWriter::new(output),
        output_path,
        options,
        reporter,
    )?;

    Ok(ConvertSummary {
        blocks,
        payload_bytes: image.len(),
        output: output_path.to_owned(),
    })
}

/// Writes the image to an already created output file, removing the file again if writing fails.
fn write_file(
    image: &[u8],
    output: impl Write,
    output_path: &Path,
    options: &ConvertOptions,
    reporter: &mut dyn ProgressReporter,
) -> Result<u32, Bin2Uf2Error> {
    let result = write_output(image, output, options, reporter);
    reporter.finish();

    if result.is_err() {
        remove_partial_output(output_path);
    }

    result
}

/// Removes a partially written output. Only regular files are removed, device nodes
/// and other special files given as the output are left alone.
fn remove_partial_output(output_path: &Path) {
    match fs::metadata(output_path) {
        Ok(metadata) if metadata.is_file() => {
            if let Err(err) = fs::remove_file(output_path) {
                warn!(
                    "Failed to remove partial output {}: {}",
                    output_path.display(),
                    err
                );
            }
        }
        Ok(_) => debug!(
            "Leaving {} in place, it is not a regular file",
            output_path.display()
        ),
        Err(err) => debug!(
            "Partial output {} is already gone: {}",
            output_path.display(),
            err
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        inspect::{extract_payload, inspect},
        uf2::{UF2_FLAG_FAMILY_ID_PRESENT, UF2_MAGIC_END, UF2_MAGIC_START0, UF2_MAGIC_START1},
    };
    use rstest::rstest;
    use std::io;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bin2uf2-core-{}-{}", std::process::id(), name))
    }

    fn field(bytes: &[u8], block: usize, offset: usize) -> u32 {
        let start = block * UF2_BLOCK_SIZE + offset;
        u32::from_le_bytes(bytes[start..start + 4].try_into().unwrap())
    }

    fn to_uf2(image: &[u8], options: &ConvertOptions) -> Vec<u8> {
        let mut bytes_out = Vec::new();
        bin2uf2(image, &mut bytes_out, options).unwrap();
        bytes_out
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(255, 1)]
    #[case(256, 1)]
    #[case(257, 2)]
    #[case(300, 2)]
    #[case(512, 2)]
    #[case(513, 3)]
    fn block_count_rounds_up(#[case] len: usize, #[case] expected: usize) {
        assert_eq!(block_count(len), expected);
    }

    #[test]
    fn single_full_block() {
        let bytes_out = to_uf2(&[0xFF; 256], &ConvertOptions::default());

        assert_eq!(bytes_out.len(), 512);
        assert_eq!(field(&bytes_out, 0, 0), UF2_MAGIC_START0);
        assert_eq!(field(&bytes_out, 0, 4), UF2_MAGIC_START1);
        assert_eq!(field(&bytes_out, 0, 8), UF2_FLAG_FAMILY_ID_PRESENT);
        assert_eq!(field(&bytes_out, 0, 12), 0x10000000);
        assert_eq!(field(&bytes_out, 0, 16), 256);
        assert_eq!(field(&bytes_out, 0, 20), 0);
        assert_eq!(field(&bytes_out, 0, 24), 1);
        assert_eq!(field(&bytes_out, 0, 28), 0xe48bff56);
        assert!(bytes_out[32..288].iter().all(|&b| b == 0xFF));
        assert!(bytes_out[288..508].iter().all(|&b| b == 0));
        assert_eq!(field(&bytes_out, 0, 508), UF2_MAGIC_END);
    }

    #[test]
    fn partial_last_block_is_zero_padded() {
        let image: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8 + 1).collect();
        let bytes_out = to_uf2(&image, &ConvertOptions::default());

        assert_eq!(bytes_out.len(), 2 * 512);
        assert_eq!(bytes_out[32..288], image[0..256]);

        let second = &bytes_out[512..1024];
        assert_eq!(second[32..76], image[256..300]);
        assert!(second[76..508].iter().all(|&b| b == 0));
        assert_eq!(field(&bytes_out, 1, 20), 1);
        assert_eq!(field(&bytes_out, 1, 24), 2);
        assert_eq!(field(&bytes_out, 1, 12), 0x10000100);
    }

    #[test]
    fn headers_are_consistent_across_blocks() {
        let image = vec![0x5Au8; 10 * 256 + 17];
        let options = ConvertOptions {
            base_address: 0x2000_0000,
            family_id: Family::RP2350_RISCV.id(),
        };
        let bytes_out = to_uf2(&image, &options);
        let blocks = bytes_out.len() / UF2_BLOCK_SIZE;

        assert_eq!(bytes_out.len() % UF2_BLOCK_SIZE, 0);
        assert_eq!(blocks, 11);

        for block in 0..blocks {
            assert_eq!(field(&bytes_out, block, 0), UF2_MAGIC_START0);
            assert_eq!(field(&bytes_out, block, 4), UF2_MAGIC_START1);
            assert_eq!(field(&bytes_out, block, 8), UF2_FLAG_FAMILY_ID_PRESENT);
            assert_eq!(
                field(&bytes_out, block, 12),
                0x2000_0000 + block as u32 * 256
            );
            assert_eq!(field(&bytes_out, block, 16), 256);
            assert_eq!(field(&bytes_out, block, 20), block as u32);
            assert_eq!(field(&bytes_out, block, 24), blocks as u32);
            assert_eq!(field(&bytes_out, block, 28), 0xe48bff5a);
            assert_eq!(field(&bytes_out, block, 508), UF2_MAGIC_END);
        }
    }

    #[test]
    fn payload_round_trips() {
        let image: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        let bytes_out = to_uf2(&image, &ConvertOptions::default());

        let mut payload = extract_payload(&bytes_out).unwrap();
        assert_eq!(payload.len(), block_count(image.len()) * 256);
        assert!(payload[image.len()..].iter().all(|&b| b == 0));

        payload.truncate(image.len());
        assert_eq!(payload, image);

        let summary = inspect(&bytes_out).unwrap();
        assert_eq!(summary.blocks, 20);
        assert_eq!(summary.first_addr, FLASH_START);
        assert_eq!(summary.last_addr, FLASH_START + 19 * 256);
    }

    #[test]
    fn empty_image_is_rejected() {
        let mut bytes_out = Vec::new();
        let err = bin2uf2(&[0u8; 0][..], &mut bytes_out, &ConvertOptions::default()).unwrap_err();

        assert!(matches!(err, Bin2Uf2Error::EmptyInput));
        assert!(bytes_out.is_empty());
    }

    #[test]
    fn addresses_past_4gib_are_rejected() {
        let options = ConvertOptions {
            base_address: 0xFFFF_FF00,
            family_id: Family::RP2040.id(),
        };

        assert_eq!(to_uf2(&[1; 256], &options).len(), 512);

        let mut bytes_out = Vec::new();
        let err = bin2uf2(&[1u8; 257][..], &mut bytes_out, &options).unwrap_err();
        assert!(matches!(
            err,
            Bin2Uf2Error::ImageTooLarge {
                len: 257,
                base_address: 0xFFFF_FF00
            }
        ));
        assert!(bytes_out.is_empty());
    }

    /// Passes the first block through to `inner`, then fails every write.
    struct FailingWriter<W> {
        inner: W,
        accepted: usize,
    }

    impl<W: Write> FailingWriter<W> {
        fn new(inner: W) -> Self {
            Self { inner, accepted: 0 }
        }
    }

    impl<W: Write> Write for FailingWriter<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accepted >= UF2_BLOCK_SIZE {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let written = self.inner.write(buf)?;
            self.accepted += written;
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn write_errors_are_reported() {
        let err = bin2uf2(
            &[0u8; 1024][..],
            FailingWriter::new(io::sink()),
            &ConvertOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Bin2Uf2Error::FailedToWrite(_)));
    }

    #[test]
    fn failed_write_removes_partial_output() {
        let output = temp_path("partial-out.uf2");
        let file = File::create(&output).unwrap();

        let mut reporter = RecordingReporter::default();
        let err = write_file(
            &[0x11; 1024],
            FailingWriter::new(file),
            &output,
            &ConvertOptions::default(),
            &mut reporter,
        )
        .unwrap_err();

        assert!(matches!(err, Bin2Uf2Error::FailedToWrite(_)));
        assert_eq!(reporter.advanced, UF2_BLOCK_SIZE);
        assert!(reporter.finished);
        assert!(!output.exists());
    }

    #[test]
    fn failed_write_leaves_special_files_alone() {
        let output = temp_path("special-out");
        fs::create_dir(&output).unwrap();

        let err = write_file(
            &[0x11; 1024],
            FailingWriter::new(io::sink()),
            &output,
            &ConvertOptions::default(),
            &mut NoProgress,
        )
        .unwrap_err();

        assert!(matches!(err, Bin2Uf2Error::FailedToWrite(_)));
        assert!(output.is_dir());

        fs::remove_dir(&output).unwrap();
    }

    #[derive(Default)]
    struct RecordingReporter {
        total: usize,
        advanced: usize,
        finished: bool,
    }

    impl ProgressReporter for RecordingReporter {
        fn start(&mut self, total_bytes: usize) {
            self.total = total_bytes;
        }

        fn advance(&mut self, bytes: usize) {
            self.advanced += bytes;
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn convert_writes_file_and_reports_progress() {
        let input = temp_path("convert-in.bin");
        let output = temp_path("convert-out.uf2");
        fs::write(&input, vec![0xA5u8; 700]).unwrap();

        let mut reporter = RecordingReporter::default();
        let summary = convert(&input, &output, &ConvertOptions::default(), &mut reporter).unwrap();

        assert_eq!(summary.blocks, 3);
        assert_eq!(summary.payload_bytes, 700);
        assert_eq!(summary.output, output);
        assert_eq!(reporter.total, 3 * 512);
        assert_eq!(reporter.advanced, 3 * 512);
        assert!(reporter.finished);

        let bytes_out = fs::read(&output).unwrap();
        assert_eq!(bytes_out, to_uf2(&[0xA5; 700], &ConvertOptions::default()));

        fs::remove_file(&input).unwrap();
        fs::remove_file(&output).unwrap();
    }

    #[test]
    fn convert_overwrites_existing_output() {
        let input = temp_path("overwrite-in.bin");
        let output = temp_path("overwrite-out.uf2");
        fs::write(&input, [1u8; 10]).unwrap();
        fs::write(&output, vec![0xEEu8; 4096]).unwrap();

        convert(&input, &output, &ConvertOptions::default(), &mut NoProgress).unwrap();

        assert_eq!(fs::read(&output).unwrap().len(), 512);

        fs::remove_file(&input).unwrap();
        fs::remove_file(&output).unwrap();
    }

    #[test]
    fn missing_input_creates_no_output() {
        let input = temp_path("missing-in.bin");
        let output = temp_path("missing-out.uf2");

        let err =
            convert(&input, &output, &ConvertOptions::default(), &mut NoProgress).unwrap_err();

        match err {
            Bin2Uf2Error::InputNotFound { path, source } => {
                assert_eq!(path, input);
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!output.exists());
    }

    #[test]
    fn empty_input_file_creates_no_output() {
        let input = temp_path("empty-in.bin");
        let output = temp_path("empty-out.uf2");
        fs::write(&input, b"").unwrap();

        let err =
            convert(&input, &output, &ConvertOptions::default(), &mut NoProgress).unwrap_err();

        assert!(matches!(err, Bin2Uf2Error::EmptyInput));
        assert!(!output.exists());

        fs::remove_file(&input).unwrap();
    }

    #[test]
    fn unwritable_output_is_reported() {
        let input = temp_path("unwritable-in.bin");
        let output = temp_path("no-such-dir").join("out.uf2");
        fs::write(&input, [1u8; 10]).unwrap();

        let err =
            convert(&input, &output, &ConvertOptions::default(), &mut NoProgress).unwrap_err();

        assert!(matches!(err, Bin2Uf2Error::FailedToCreate { .. }));
        assert!(!output.exists());

        fs::remove_file(&input).unwrap();
    }

    #[test]
    fn family_names_resolve() {
        assert_eq!(Family::from_name("rp2040"), Some(Family::RP2040));
        assert_eq!(Family::from_name("RP2350-RISCV"), Some(Family::RP2350_RISCV));
        assert_eq!(Family::from_name("esp32"), None);
        assert_eq!(Family::from_id(0xe48bff5b), Some(Family::RP2350_ARM_NS));
        assert_eq!(Family::from_id(0x12345678), None);
        assert_eq!(Family::default().id(), 0xe48bff56);

        for family in Family::ALL {
            assert_eq!(Family::from_name(family.name()), Some(*family));
        }
    }
}
