use std::io::Cursor;

use tvault_chunks::{compress, decompress_bounded, digest_hex, ChunkBuffer, ChunkWriter, Splitter};

const MIB: usize = 1024 * 1024;

// Text-like bytes: compressible, but not trivially
fn sample(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| b"abcdefghij klmnop\n"[(i * 31 + i / 97) % 18])
        .collect()
}

/// Split 8 MiB at several chunk sizes.
#[divan::bench(args = [64 * 1024, 512 * 1024, 4 * MIB])]
fn split(bencher: divan::Bencher, chunk_size: usize) {
    let data = sample(8 * MIB);
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| {
            Splitter::new(Cursor::new(divan::black_box(&data)), chunk_size as u64)
                .unwrap()
                .map(|c| c.unwrap().size)
                .sum::<u64>()
        });
}

#[divan::bench(args = [4096, MIB])]
fn chunk_buffer_small_writes(bencher: divan::Bencher, chunk_size: usize) {
    let data = sample(4 * MIB);
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench(|| {
            let mut buf = ChunkBuffer::new(chunk_size).unwrap();
            let mut n = 0;
            for piece in data.chunks(1500) {
                n += buf.write(piece).len();
            }
            n + buf.flush().map_or(0, |_| 1)
        });
}

/// Hash-then-compress of one stored chunk, as the upload path does it.
#[divan::bench(args = [64 * 1024, MIB, 8 * MIB])]
fn encode_chunk(bencher: divan::Bencher, size: usize) {
    let data = sample(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let stored = compress(divan::black_box(&data)).unwrap();
            digest_hex(&stored)
        });
}

#[divan::bench(args = [64 * 1024, MIB, 8 * MIB])]
fn decode_chunk(bencher: divan::Bencher, size: usize) {
    let stored = compress(&sample(size)).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decompress_bounded(divan::black_box(&stored), size as u64).unwrap());
}

/// Reassemble 64 chunks written back to front.
#[divan::bench]
fn reassemble_reverse_order(bencher: divan::Bencher) {
    let chunk_size = 64 * 1024;
    let data = sample(64 * chunk_size);
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("out.bin");
    bencher
        .counter(divan::counter::BytesCount::new(data.len()))
        .bench_local(|| {
            let mut writer =
                ChunkWriter::create(&path, data.len() as u64, chunk_size as u64).unwrap();
            for (i, piece) in data.chunks(chunk_size).enumerate().rev() {
                writer.write_chunk(i as u64, piece).unwrap();
            }
            writer.finish().unwrap()
        });
}

fn main() {
    divan::main();
}
