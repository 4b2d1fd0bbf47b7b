//! tvault-chunks: fixed-size chunking, BLAKE3 hashing, and zstd compression
//!
//! # Overview
//! - `blake3`: deterministic file/slice hashing (content identity and integrity)
//! - `splitter`: lazy file splitting, random chunk reads, incremental chunk buffer
//! - `writer`: order-independent reassembly into a pre-sized output file
//! - `compress`: extension-driven zstd compression, one-shot and streaming

pub mod blake3;
pub mod compress;
pub mod splitter;
pub mod writer;

// Convenience re-exports for the most common operations
pub use blake3::{digest_hex, hash_bytes, hash_file, hash_from_hex, hash_to_hex, Hash};
pub use compress::{
    compress, compress_file, decompress, decompress_bounded, decompress_file,
    estimate_compressed_size, max_compressed_size, should_compress, StreamingCompressor,
    StreamingDecompressor,
};
pub use splitter::{
    check_chunk_size, chunk_filename, count_chunks, read_chunk, split, Chunk, ChunkBuffer,
    Splitter,
};
pub use writer::ChunkWriter;
