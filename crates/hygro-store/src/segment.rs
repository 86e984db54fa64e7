//! Device file segments of the partitioned file store.
//!
//! A segment is a JSON-lines file holding readings of one device in one
//! partition. Layout inside a partition directory:
//!
//! ```text
//! readings_A4C138001122        first segment
//! readings_A4C138001122.1      rolled segment
//! readings_A4C138001122.1.gz   compressed segment
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;

use hygro_types::Reading;

use crate::error::Result;

const PREFIX: &str = "readings_";
const GZ_SUFFIX: &str = ".gz";
const TMP_SUFFIX: &str = ".tmp";

/// File key of a device: its address with `:` and `-` removed, upper-cased.
///
/// Any other character that is not ASCII alphanumeric is written as the hex
/// of its UTF-8 bytes. An address made only of separators is hex-encoded
/// whole, so only the empty address has an empty key.
///
/// ```
/// use hygro_store::device_key;
///
/// assert_eq!(device_key("a4:c1:38:00:11:22"), "A4C138001122");
/// assert_eq!(device_key("A4-C1-38-00-11-22"), "A4C138001122");
/// assert_eq!(device_key("shed/1"), "SHED2F1");
/// assert_eq!(device_key("--"), "2D2D");
/// ```
pub fn device_key(device_addr: &str) -> String {
    let mut key = String::with_capacity(device_addr.len());
    for c in device_addr.chars() {
        match c {
            ':' | '-' => {}
            c if c.is_ascii_alphanumeric() => key.push(c.to_ascii_uppercase()),
            c => {
                let mut buf = [0; 4];
                key.extend(c.encode_utf8(&mut buf).bytes().map(hex_byte));
            }
        }
    }
    if key.is_empty() {
        key = device_addr.bytes().map(hex_byte).collect();
    }
    key
}

fn hex_byte(byte: u8) -> String {
    format!("{byte:02X}")
}

/// Parsed name of a segment file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentName {
    pub device_key: String,
    pub seq: u32,
    pub compressed: bool,
}

impl SegmentName {
    pub fn new(device_key: impl Into<String>, seq: u32) -> Self {
        Self {
            device_key: device_key.into(),
            seq,
            compressed: false,
        }
    }

    pub fn file_name(&self) -> String {
        let mut name = format!("{PREFIX}{}", self.device_key);
        if self.seq > 0 {
            name.push_str(&format!(".{}", self.seq));
        }
        if self.compressed {
            name.push_str(GZ_SUFFIX);
        }
        name
    }

    /// Parse a directory entry name; `None` for anything that is not a segment.
    pub fn parse(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(PREFIX)?;
        let (rest, compressed) = match rest.strip_suffix(GZ_SUFFIX) {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let (key, seq) = match rest.split_once('.') {
            Some((key, seq)) => (key, seq.parse().ok().filter(|s| *s > 0)?),
            None => (rest, 0),
        };
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self {
            device_key: key.to_string(),
            seq,
            compressed,
        })
    }

    /// The same segment after compression.
    pub fn compressed(&self) -> Self {
        Self {
            compressed: true,
            ..self.clone()
        }
    }
}

/// Segment files found in a partition directory, sorted by device key then sequence.
pub fn list(dir: &Path) -> Result<Vec<SegmentName>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(segment) = entry.file_name().to_str().and_then(SegmentName::parse) {
            segments.push(segment);
        }
    }
    segments.sort();
    Ok(segments)
}

/// Readings decoded from one segment.
#[derive(Debug, Default)]
pub struct Decoded {
    pub readings: Vec<Reading>,
    /// Lines that could not be decoded and were skipped.
    pub corrupt_lines: usize,
}

/// Decode a segment, transparently decompressing `.gz` files.
///
/// Undecodable lines are skipped and counted; I/O and decompression
/// failures are returned so the caller can skip the whole segment.
pub fn read(path: &Path, compressed: bool) -> Result<Decoded> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if compressed {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut decoded = Decoded::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Reading>(&line) {
            Ok(reading) => decoded.readings.push(reading),
            Err(e) => {
                warn!("Skipping corrupt line {} in {}: {}", index + 1, path.display(), e);
                decoded.corrupt_lines += 1;
            }
        }
    }
    Ok(decoded)
}

/// Number of lines in an uncompressed segment.
///
/// A final line without its newline (an append cut short) is terminated
/// first, so the next append starts on a line of its own and the torn
/// line is skipped as corrupt on read.
pub fn seal_lines(path: &Path) -> Result<usize> {
    let bytes = fs::read(path)?;
    let mut lines = bytes.iter().filter(|b| **b == b'\n').count();
    if bytes.last().is_some_and(|b| *b != b'\n') {
        warn!("Terminating torn final line of {}", path.display());
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        lines += 1;
    }
    Ok(lines)
}

/// Append readings to an uncompressed segment, creating it if absent.
pub fn append<'a>(path: &Path, readings: impl IntoIterator<Item = &'a Reading>) -> Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    for reading in readings {
        serde_json::to_writer(&mut writer, reading)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Replace a segment's contents, keeping its compression.
///
/// Writes to a temporary sibling and renames it over the original.
pub fn rewrite(path: &Path, compressed: bool, readings: &[Reading]) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let file = File::create(&tmp)?;
        if compressed {
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            write_lines(&mut encoder, readings)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(file);
            write_lines(&mut writer, readings)?;
            writer.flush()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Gzip an uncompressed segment in place.
///
/// The compressed file is fully written and renamed into place before the
/// original is removed, so a crash leaves at least one complete copy.
/// Returns the path of the compressed segment.
pub fn compress(path: &Path) -> Result<PathBuf> {
    let target = PathBuf::from(format!("{}{GZ_SUFFIX}", path.display()));
    let tmp = tmp_path(&target);
    {
        let mut input = File::open(path)?;
        let output = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, &target)?;
    fs::remove_file(path)?;
    Ok(target)
}

fn write_lines<W: Write>(writer: &mut W, readings: &[Reading]) -> Result<()> {
    for reading in readings {
        serde_json::to_writer(&mut *writer, reading)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{TMP_SUFFIX}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(minute: i64) -> Reading {
        Reading::new(
            "A4:C1:38:00:11:22",
            datetime!(2024-01-01 00:00 UTC) + time::Duration::minutes(minute),
            20.0 + minute as f64 / 10.0,
            45.0,
        )
    }

    #[test]
    fn test_segment_name_round_trip() {
        let cases = [
            (SegmentName::new("AABB", 0), "readings_AABB"),
            (SegmentName::new("AABB", 3), "readings_AABB.3"),
            (SegmentName::new("AABB", 3).compressed(), "readings_AABB.3.gz"),
            (SegmentName::new("AABB", 0).compressed(), "readings_AABB.gz"),
        ];
        for (segment, name) in cases {
            assert_eq!(segment.file_name(), name);
            assert_eq!(SegmentName::parse(name), Some(segment));
        }
    }

    #[test]
    fn test_segment_name_rejects_other_files() {
        for name in [
            ".compacted",
            "readings_",
            "readings_AABB.gz.tmp",
            "readings_AABB.tmp",
            "readings_AABB.0",
            "readings_AA:BB",
            "notes.txt",
        ] {
            assert_eq!(SegmentName::parse(name), None, "{name}");
        }
    }

    #[test]
    fn test_segment_sort_order() {
        let mut names = vec![
            SegmentName::new("BB", 0),
            SegmentName::new("AA", 2),
            SegmentName::new("AA", 0).compressed(),
            SegmentName::new("AA", 1),
        ];
        names.sort();
        let seqs: Vec<_> = names.iter().map(|n| (n.device_key.as_str(), n.seq)).collect();
        assert_eq!(seqs, vec![("AA", 0), ("AA", 1), ("AA", 2), ("BB", 0)]);
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings_A4C138001122");
        let readings: Vec<_> = (0..5).map(reading).collect();

        append(&path, &readings[..2]).unwrap();
        append(&path, &readings[2..]).unwrap();

        assert_eq!(seal_lines(&path).unwrap(), 5);
        let decoded = read(&path, false).unwrap();
        assert_eq!(decoded.readings, readings);
        assert_eq!(decoded.corrupt_lines, 0);
    }

    #[test]
    fn test_compress_preserves_readings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings_A4C138001122");
        let readings: Vec<_> = (0..50).map(reading).collect();
        append(&path, &readings).unwrap();

        let compressed = compress(&path).unwrap();
        assert!(!path.exists());
        assert!(compressed.ends_with("readings_A4C138001122.gz"));
        assert_eq!(read(&compressed, true).unwrap().readings, readings);
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings_A4C138001122");
        append(&path, &[reading(0)]).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{not json\n").unwrap();
        }
        append(&path, &[reading(1)]).unwrap();

        let decoded = read(&path, false).unwrap();
        assert_eq!(decoded.readings.len(), 2);
        assert_eq!(decoded.corrupt_lines, 1);
    }

    #[test]
    fn test_device_key_is_a_valid_segment_key() {
        for addr in ["--", ":", "Ä:Ö", "sensor.1", "A4:C1:38:00:11:22"] {
            let key = device_key(addr);
            assert!(!key.is_empty(), "{addr}");
            let name = SegmentName::new(key.clone(), 0);
            assert_eq!(SegmentName::parse(&name.file_name()).map(|s| s.device_key), Some(key));
        }
        assert_eq!(device_key("Ä:Ö"), "C384C396");
        assert_eq!(device_key(""), "");
    }

    #[test]
    fn test_seal_lines_terminates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings_A4C138001122");
        append(&path, &[reading(0)]).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"device_addr":"A4:C1"#).unwrap();
        }

        assert_eq!(seal_lines(&path).unwrap(), 2);
        append(&path, &[reading(1)]).unwrap();
        // Already terminated: nothing more is written.
        assert_eq!(seal_lines(&path).unwrap(), 3);

        let decoded = read(&path, false).unwrap();
        assert_eq!(decoded.readings, vec![reading(0), reading(1)]);
        assert_eq!(decoded.corrupt_lines, 1);
    }

    #[test]
    fn test_garbage_gzip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings_A4C138001122.gz");
        fs::write(&path, b"definitely not gzip").unwrap();
        assert!(read(&path, true).is_err());
    }

    #[test]
    fn test_rewrite_keeps_compression() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readings_A4C138001122");
        append(&path, &[reading(0), reading(1), reading(2)]).unwrap();
        let gz = compress(&path).unwrap();

        rewrite(&gz, true, &[reading(1)]).unwrap();
        assert_eq!(read(&gz, true).unwrap().readings, vec![reading(1)]);
    }
}
