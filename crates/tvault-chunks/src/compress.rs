//! zstd compression for chunk payloads
//!
//! Whether a file is compressed is decided purely by its extension: formats
//! that already carry their own compression are sent as-is.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tvault_core::{VaultError, VaultResult};

/// zstd level used for all chunk payloads
pub const COMPRESSION_LEVEL: i32 = 3;

/// Extensions whose content is already compressed.
#[rustfmt::skip]
const SKIP_EXTENSIONS: &[&str] = &[
    // images
    "jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "avif",
    // video
    "mp4", "mkv", "avi", "mov", "webm", "m4v", "wmv", "flv",
    // audio
    "mp3", "aac", "ogg", "opus", "flac", "m4a", "wma",
    // archives
    "zip", "gz", "bz2", "xz", "7z", "rar", "zst", "lz4", "lzma",
    // documents
    "pdf", "docx", "xlsx", "pptx", "odt",
    // other
    "woff", "woff2", "br",
];

const TEXT_EXTENSIONS: &[&str] = &["txt", "log", "csv", "json", "xml", "html", "md"];
const CODE_EXTENSIONS: &[&str] = &["sql", "py", "js", "ts", "go", "rs", "c", "cpp", "h"];
const CONTAINER_EXTENSIONS: &[&str] = &["tar", "iso", "img"];

fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// False for known already-compressed formats, true for everything else.
pub fn should_compress(filename: &str) -> bool {
    match extension(filename) {
        Some(ext) => !SKIP_EXTENSIONS.contains(&ext.as_str()),
        None => true,
    }
}

/// Compress a byte slice into a single zstd frame.
pub fn compress(data: &[u8]) -> VaultResult<Vec<u8>> {
    Ok(zstd::encode_all(data, COMPRESSION_LEVEL)?)
}

/// Decompress a zstd stream produced by [`compress`].
pub fn decompress(data: &[u8]) -> VaultResult<Vec<u8>> {
    Ok(zstd::decode_all(data)?)
}

/// Decompress, refusing to produce more than `limit` bytes.
pub fn decompress_bounded(data: &[u8], limit: u64) -> VaultResult<Vec<u8>> {
    let decoder = zstd::stream::read::Decoder::new(data)?;
    let mut out = Vec::new();
    decoder.take(limit.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(VaultError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed payload exceeds {limit} bytes"),
        )));
    }
    Ok(out)
}

/// Worst-case size of [`compress`] output for `len` input bytes.
pub fn max_compressed_size(len: u64) -> u64 {
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    zstd::zstd_safe::compress_bound(len) as u64
}

/// Rough stored size for a file, used for pre-upload estimates.
pub fn estimate_compressed_size(original_size: u64, filename: &str) -> u64 {
    if !should_compress(filename) {
        return original_size;
    }
    let ratio = match extension(filename).as_deref() {
        Some(ext) if TEXT_EXTENSIONS.contains(&ext) => 0.2,
        Some(ext) if CODE_EXTENSIONS.contains(&ext) => 0.25,
        Some(ext) if CONTAINER_EXTENSIONS.contains(&ext) => 0.6,
        _ => 0.5,
    };
    (original_size as f64 * ratio) as u64
}

/// Writer adapter that counts bytes passing through.
#[derive(Debug)]
struct Counting<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for Counting<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Incremental compressor with live input/output counters.
pub struct StreamingCompressor<W: Write> {
    encoder: zstd::stream::write::Encoder<'static, Counting<W>>,
    bytes_in: u64,
}

impl<W: Write> StreamingCompressor<W> {
    pub fn new(output: W) -> VaultResult<Self> {
        let encoder = zstd::stream::write::Encoder::new(
            Counting {
                inner: output,
                count: 0,
            },
            COMPRESSION_LEVEL,
        )?;
        Ok(Self {
            encoder,
            bytes_in: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> VaultResult<()> {
        self.encoder.write_all(data)?;
        self.bytes_in += data.len() as u64;
        Ok(())
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Compressed bytes emitted so far (lags until the encoder flushes).
    pub fn bytes_out(&self) -> u64 {
        self.encoder.get_ref().count
    }

    /// Current `bytes_out / bytes_in`; 1.0 before any input.
    pub fn ratio(&self) -> f64 {
        ratio(self.bytes_in, self.bytes_out())
    }

    /// End the frame. Returns the output writer and the final ratio.
    pub fn finish(mut self) -> VaultResult<(W, f64)> {
        self.encoder.do_finish()?;
        let ratio = self.ratio();
        let counting = self.encoder.finish()?;
        Ok((counting.inner, ratio))
    }
}

/// Incremental decompressor with live input/output counters.
pub struct StreamingDecompressor<W: Write> {
    decoder: zstd::stream::write::Decoder<'static, Counting<W>>,
    bytes_in: u64,
}

impl<W: Write> StreamingDecompressor<W> {
    pub fn new(output: W) -> VaultResult<Self> {
        let decoder = zstd::stream::write::Decoder::new(Counting {
            inner: output,
            count: 0,
        })?;
        Ok(Self {
            decoder,
            bytes_in: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> VaultResult<()> {
        self.decoder.write_all(data)?;
        self.bytes_in += data.len() as u64;
        Ok(())
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.decoder.get_ref().count
    }

    /// Flush remaining plaintext. Returns the output writer and the total
    /// plaintext bytes produced.
    pub fn finish(mut self) -> VaultResult<(W, u64)> {
        self.decoder.flush()?;
        let total = self.bytes_out();
        Ok((self.decoder.into_inner().inner, total))
    }
}

fn ratio(bytes_in: u64, bytes_out: u64) -> f64 {
    if bytes_in == 0 {
        1.0
    } else {
        bytes_out as f64 / bytes_in as f64
    }
}

/// Compress `input` into `output`, returning `compressed / original`.
pub fn compress_file(input: &Path, output: &Path) -> VaultResult<f64> {
    let mut reader = BufReader::new(File::open(input)?);
    let writer = BufWriter::new(File::create(output)?);
    let mut compressor = StreamingCompressor::new(writer)?;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        compressor.write(&buf[..n])?;
    }

    let original = compressor.bytes_in();
    let (mut writer, _) = compressor.finish()?;
    writer.flush()?;
    drop(writer);

    let compressed = std::fs::metadata(output)?.len();
    Ok(ratio(original, compressed))
}

/// Decompress `input` into `output`, returning the plaintext size.
pub fn decompress_file(input: &Path, output: &Path) -> VaultResult<u64> {
    let mut reader = BufReader::new(File::open(input)?);
    let writer = BufWriter::new(File::create(output)?);
    let mut decompressor = StreamingDecompressor::new(writer)?;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        decompressor.write(&buf[..n])?;
    }

    let (mut writer, written) = decompressor.finish()?;
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn skips_already_compressed_formats() {
        assert!(!should_compress("holiday.JPG"));
        assert!(!should_compress("movie.mkv"));
        assert!(!should_compress("backup.tar.gz"));
        assert!(!should_compress("paper.pdf"));
        assert!(should_compress("notes.txt"));
        assert!(should_compress("main.rs"));
        assert!(should_compress("Makefile"));
        assert!(should_compress("disk.img"));
    }

    #[test]
    fn empty_roundtrip() {
        let c = compress(b"").unwrap();
        assert_eq!(decompress(&c).unwrap(), b"");
    }

    #[test]
    fn compressible_data_shrinks() {
        let data = b"tvault ".repeat(10_000);
        let c = compress(&data).unwrap();
        assert!(c.len() < data.len() / 10);
        assert_eq!(decompress(&c).unwrap(), data);
    }

    #[test]
    fn bounded_decompress_rejects_bombs() {
        let data = vec![0u8; 100_000];
        let c = compress(&data).unwrap();
        assert_eq!(decompress_bounded(&c, 100_000).unwrap(), data);
        assert!(decompress_bounded(&c, 99_999).is_err());
    }

    #[test]
    fn garbage_does_not_decompress() {
        assert!(decompress(b"definitely not zstd").is_err());
    }

    #[test]
    fn estimates_by_extension() {
        assert_eq!(estimate_compressed_size(1000, "a.txt"), 200);
        assert_eq!(estimate_compressed_size(1000, "a.py"), 250);
        assert_eq!(estimate_compressed_size(1000, "a.iso"), 600);
        assert_eq!(estimate_compressed_size(1000, "a.bin"), 500);
        assert_eq!(estimate_compressed_size(1000, "a.mp4"), 1000);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"stream me ".repeat(5_000);
        let mut comp = StreamingCompressor::new(Vec::new()).unwrap();
        for piece in data.chunks(777) {
            comp.write(piece).unwrap();
        }
        assert_eq!(comp.bytes_in(), data.len() as u64);
        let (compressed, ratio) = comp.finish().unwrap();
        assert!(ratio < 0.1);

        let mut decomp = StreamingDecompressor::new(Vec::new()).unwrap();
        for piece in compressed.chunks(100) {
            decomp.write(piece).unwrap();
        }
        assert_eq!(decomp.bytes_in(), compressed.len() as u64);
        let (plain, total) = decomp.finish().unwrap();
        assert_eq!(total, data.len() as u64);
        assert_eq!(plain, data);
    }

    #[test]
    fn ratio_before_input_is_one() {
        let comp = StreamingCompressor::new(Vec::new()).unwrap();
        assert_eq!(comp.ratio(), 1.0);
    }

    #[test]
    fn file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = tmp.path().join("in.log");
        let packed = tmp.path().join("in.log.zst");
        let out = tmp.path().join("out.log");
        let data = b"2026-01-01 INFO upload finished\n".repeat(2_000);
        std::fs::write(&src, &data).unwrap();

        let ratio = compress_file(&src, &packed).unwrap();
        assert!(ratio > 0.0 && ratio < 0.2);
        let size = decompress_file(&packed, &out).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn empty_file_ratio_is_one() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = tmp.path().join("empty");
        std::fs::write(&src, b"").unwrap();
        let ratio = compress_file(&src, &tmp.path().join("empty.zst")).unwrap();
        assert_eq!(ratio, 1.0);
    }

    proptest! {
        #[test]
        fn output_never_exceeds_bound(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let c = compress(&data).unwrap();
            prop_assert!(c.len() as u64 <= max_compressed_size(data.len() as u64));
        }

        #[test]
        fn inverse_law(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            let c = compress(&data).unwrap();
            prop_assert_eq!(decompress(&c).unwrap(), data);
        }
    }
}
