//! WAV header validation and repair
//!
//! Live captures are finalized by an external process that may die before
//! patching chunk sizes into the RIFF header, leaving a file whose header
//! claims a different data length than the bytes actually on disk. Every
//! reader in the pipeline goes through [`sanitize`] first so that durations
//! and seek offsets are computed from the true data length.
//!
//! Only the canonical 44-byte PCM header is handled; that is the one layout
//! the capture side produces (16 kHz mono s16le).

use log::{debug, info};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Canonical PCM WAV header length in bytes
pub const WAV_HEADER_LEN: u64 = 44;

/// Header/data mismatch below this many bytes is left alone
const REPAIR_THRESHOLD_BYTES: u64 = 1024;

/// Errors from WAV inspection and repair
#[derive(Debug, thiserror::Error)]
pub enum WavError {
    #[error("Not a WAV file: {0}")]
    NotWav(String),

    #[error("File too small to hold a WAV header ({0} bytes)")]
    TooSmall(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed header joined with the on-disk truth
#[derive(Debug, Clone, PartialEq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    /// Data length the header claims
    pub header_data_size: u64,
    /// Data length actually present: file size minus the 44-byte header
    pub actual_data_size: u64,
    /// Duration computed from the actual data size
    pub duration_seconds: f64,
    /// True when this call rewrote the header
    pub repaired: bool,
}

impl WavInfo {
    pub fn duration_ms(&self) -> u64 {
        (self.duration_seconds * 1000.0).round() as u64
    }

    fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * (self.bit_depth as u64 / 8)
    }
}

/// Inspect a WAV file and repair its header if the declared data size has
/// drifted more than a kibibyte from the bytes on disk.
///
/// The repair rewrites the RIFF chunk size (file size − 8) and the data
/// chunk size (actual data size) in place and fsyncs. Sample data is never
/// touched, so a second call on the same file is a no-op.
pub fn sanitize(path: &Path) -> Result<WavInfo, WavError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_size = file.metadata()?.len();

    if file_size <= WAV_HEADER_LEN {
        return Err(WavError::TooSmall(file_size));
    }

    let mut header = [0u8; WAV_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;

    if &header[0..4] != b"RIFF" {
        return Err(WavError::NotWav("missing RIFF magic".to_string()));
    }
    if &header[8..12] != b"WAVE" {
        return Err(WavError::NotWav("missing WAVE magic".to_string()));
    }
    if &header[12..16] != b"fmt " {
        return Err(WavError::NotWav("missing fmt chunk".to_string()));
    }
    if &header[36..40] != b"data" {
        return Err(WavError::NotWav("missing data chunk".to_string()));
    }

    let channels = u16::from_le_bytes([header[22], header[23]]);
    let sample_rate = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
    let bit_depth = u16::from_le_bytes([header[34], header[35]]);
    let header_data_size =
        u32::from_le_bytes([header[40], header[41], header[42], header[43]]) as u64;

    if channels == 0 || sample_rate == 0 || bit_depth == 0 || bit_depth % 8 != 0 {
        return Err(WavError::NotWav(format!(
            "implausible format: {} ch, {} Hz, {} bit",
            channels, sample_rate, bit_depth
        )));
    }

    let actual_data_size = file_size - WAV_HEADER_LEN;
    let drift = header_data_size.abs_diff(actual_data_size);
    let mut repaired = false;

    if drift > REPAIR_THRESHOLD_BYTES {
        info!(
            "Repairing WAV header for {:?}: declared {} bytes, actual {} bytes",
            path, header_data_size, actual_data_size
        );

        let riff_size = (file_size - 8) as u32;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&riff_size.to_le_bytes())?;
        file.seek(SeekFrom::Start(40))?;
        file.write_all(&(actual_data_size as u32).to_le_bytes())?;
        file.sync_all()?;
        repaired = true;
    } else if drift > 0 {
        debug!(
            "WAV header drift of {} bytes for {:?} is under threshold, leaving alone",
            drift, path
        );
    }

    let mut info = WavInfo {
        sample_rate,
        channels,
        bit_depth,
        header_data_size: if repaired {
            actual_data_size
        } else {
            header_data_size
        },
        actual_data_size,
        duration_seconds: 0.0,
        repaired,
    };
    info.duration_seconds = actual_data_size as f64 / info.bytes_per_second() as f64;

    Ok(info)
}

/// Write a canonical 44-byte PCM header for the given format and data size.
/// The capture side and test fixtures both use this rather than an encoder
/// crate, since the header is fixed-layout.
pub fn write_wav_header<W: Write>(
    out: &mut W,
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
    data_size: u32,
) -> std::io::Result<()> {
    let byte_rate = sample_rate * channels as u32 * (bit_depth as u32 / 8);
    let block_align = channels * (bit_depth / 8);

    out.write_all(b"RIFF")?;
    out.write_all(&(36 + data_size).to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&1u16.to_le_bytes())?; // PCM
    out.write_all(&channels.to_le_bytes())?;
    out.write_all(&sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&block_align.to_le_bytes())?;
    out.write_all(&bit_depth.to_le_bytes())?;
    out.write_all(b"data")?;
    out.write_all(&data_size.to_le_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn write_fixture(path: &Path, declared_data_size: u32, actual_data_size: usize) {
        let mut bytes = Vec::new();
        write_wav_header(&mut Cursor::new(&mut bytes), 16_000, 1, 16, declared_data_size).unwrap();
        bytes.extend(std::iter::repeat(0u8).take(actual_data_size));
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn good_header_is_untouched() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("good.wav");
        write_fixture(&path, 32_000, 32_000);

        let info = sanitize(&path).expect("sanitize should succeed");
        assert!(!info.repaired);
        assert_eq!(info.sample_rate, 16_000);
        assert_eq!(info.channels, 1);
        assert_eq!(info.bit_depth, 16);
        assert_eq!(info.actual_data_size, 32_000);
        assert!((info.duration_seconds - 1.0).abs() < 1e-9);
    }

    #[test]
    fn drifted_header_is_rewritten_and_synced() {
        // Mirrors the truncated-finalizer case: header says 700_000 but the
        // file holds 1_044_000 bytes of samples.
        let dir = tempdir().unwrap();
        let path = dir.path().join("drift.wav");
        write_fixture(&path, 700_000, 1_044_000);

        let info = sanitize(&path).expect("sanitize should succeed");
        assert!(info.repaired);
        assert_eq!(info.header_data_size, 1_044_000);
        assert_eq!(info.actual_data_size, 1_044_000);
        assert!((info.duration_seconds - 32.625).abs() < 1e-9);

        // Header on disk now reflects the true sizes
        let bytes = std::fs::read(&path).unwrap();
        let riff = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
        assert_eq!(riff as u64, 1_044_044 - 8);
        assert_eq!(data, 1_044_000);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twice.wav");
        write_fixture(&path, 700_000, 1_044_000);

        let first = sanitize(&path).unwrap();
        assert!(first.repaired);
        let second = sanitize(&path).unwrap();
        assert!(!second.repaired);
        assert_eq!(second.header_data_size, first.header_data_size);
        assert_eq!(second.duration_seconds, first.duration_seconds);
    }

    #[test]
    fn small_drift_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.wav");
        write_fixture(&path, 32_000, 32_512);

        let info = sanitize(&path).unwrap();
        assert!(!info.repaired);
        assert_eq!(info.header_data_size, 32_000);
        assert_eq!(info.actual_data_size, 32_512);
    }

    #[test]
    fn rejects_non_wav() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not.wav");
        std::fs::write(&path, vec![0u8; 100]).unwrap();

        match sanitize(&path) {
            Err(WavError::NotWav(_)) => {}
            other => panic!("expected NotWav, got {:?}", other),
        }
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.wav");
        std::fs::write(&path, b"RIFF").unwrap();

        match sanitize(&path) {
            Err(WavError::TooSmall(4)) => {}
            other => panic!("expected TooSmall, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn sanitize_sanitize_equals_sanitize(
            declared in 0u32..4_000_000,
            actual in 1usize..500_000,
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("prop.wav");
            write_fixture(&path, declared, actual);

            let first = sanitize(&path).unwrap();
            let second = sanitize(&path).unwrap();
            prop_assert!(!second.repaired);
            prop_assert_eq!(first.actual_data_size, second.actual_data_size);
            prop_assert_eq!(first.header_data_size, second.header_data_size);
            prop_assert_eq!(first.duration_seconds, second.duration_seconds);
        }
    }
}
