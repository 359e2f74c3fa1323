//! pargz - parallel gzip compression and decompression.
//!
//! Splits input into fixed-size blocks, compresses them on a worker pool,
//! and reassembles the results in input order into a standard RFC 1952
//! gzip stream. Decompression recognizes streams with recoverable block
//! boundaries and decodes those in parallel too, falling back to a
//! sequential decoder for everything else.
//!
//! The library surface is [`ParallelGzWriter`] and [`ParallelGzReader`]
//! plus the one-shot `compress_*`/`decompress_*` helpers; the `pargz`
//! binary wraps these with gzip-compatible file handling.

pub mod checksum;
pub mod cli;
pub mod compress;
pub mod decompress;
pub mod error;
pub mod header;
pub mod pool;

#[cfg(test)]
mod pipeline_tests;

pub use checksum::{crc32_combine, StreamChecksum};
pub use cli::PargzArgs;
pub use compress::{
    compress_buffer, compress_file, compress_stream, Framing, GzOptions, ParallelGzWriter,
    DEFAULT_BLOCK_SIZE,
};
pub use decompress::{
    decompress_buffer, decompress_file, decompress_sequential, ParallelGzReader,
};
pub use error::{PargzError, PargzResult};
pub use header::GzipHeaderInfo;

use std::fs::{File, OpenOptions};
use std::io::BufWriter;
use std::path::Path;

/// Open a gzip file for reading. The payload is decoded eagerly; the
/// returned reader implements Read and BufRead over it.
pub fn open_read<P: AsRef<Path>>(path: P, threads: usize) -> PargzResult<ParallelGzReader> {
    ParallelGzReader::open(path, threads)
}

/// Open a file for gzip writing, truncating any existing contents.
/// The writer finalizes its trailer on `finish` or Drop.
pub fn open_write<P: AsRef<Path>>(
    path: P,
    opts: GzOptions,
) -> PargzResult<ParallelGzWriter<BufWriter<File>>> {
    let file = File::create(path)?;
    ParallelGzWriter::new(BufWriter::new(file), opts)
}

/// Open a file for gzip appending. The new data becomes an additional
/// member after any existing stream; readers see the concatenated payload.
pub fn open_append<P: AsRef<Path>>(
    path: P,
    opts: GzOptions,
) -> PargzResult<ParallelGzWriter<BufWriter<File>>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    ParallelGzWriter::new(BufWriter::new(file), opts)
}
