//! Parallel gzip compression pipeline.
//!
//! Input is sliced into fixed-size blocks, each compressed independently on
//! the worker pool (a fresh dictionary per block trades a little ratio for
//! parallel safety), and reassembled strictly in sequence order by the
//! control thread, whatever order the workers finish in.
//!
//! Two framings, both plain RFC 1952 readable by any gzip decoder:
//!
//! - **Single member** (default, the pigz wire form): one header, each block
//!   a raw deflate region terminated by a sync flush (`00 00 FF FF`), the
//!   final block carrying the deflate final-block bit, one trailer with the
//!   combined CRC32 + ISIZE.
//! - **Independent members** (`Framing::IndependentMembers`): every block is
//!   a complete gzip member with a length marker in FEXTRA so the
//!   decompressor can find boundaries without inflating.
//!
//! Framing depends only on block size, level, and framing mode, never on
//! thread count, so the same input and configuration always produce
//! byte-identical output.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::{Compress, Compression, FlushCompress, Status};
use memmap2::Mmap;

use crate::checksum::StreamChecksum;
use crate::error::{PargzError, PargzResult};
use crate::header::{self, GzipHeaderInfo};
use crate::pool::{Job, WorkerPool, WorkerResult};

/// Default block size: 128 KiB, the pigz default. Larger blocks improve
/// ratio, smaller blocks improve parallel granularity.
pub const DEFAULT_BLOCK_SIZE: usize = 128 * 1024;

/// Jobs queued per worker before `submit` applies backpressure.
const QUEUE_DEPTH_PER_WORKER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One gzip member; blocks joined by sync flushes; combined trailer.
    #[default]
    SingleMember,
    /// One gzip member per block, each with a length marker in FEXTRA.
    IndependentMembers,
}

/// Compression configuration shared by the streaming writer and the one-shot
/// entry points.
#[derive(Debug, Clone)]
pub struct GzOptions {
    /// Compression level 0-9 (0 = stored, 9 = best).
    pub level: u32,
    /// Uncompressed bytes per block.
    pub block_size: usize,
    /// Worker threads.
    pub threads: usize,
    pub framing: Framing,
    pub header: GzipHeaderInfo,
}

impl Default for GzOptions {
    fn default() -> Self {
        Self {
            level: 6,
            block_size: DEFAULT_BLOCK_SIZE,
            threads: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(4),
            framing: Framing::default(),
            header: GzipHeaderInfo::default(),
        }
    }
}

impl GzOptions {
    pub fn validate(&self) -> PargzResult<()> {
        if self.level > 9 {
            return Err(PargzError::InvalidLevel(self.level));
        }
        if self.block_size == 0 {
            return Err(PargzError::invalid_argument("block size must be non-zero"));
        }
        Ok(())
    }
}

// Workers reuse one libdeflate compressor per (thread, level) instead of
// allocating per block.
thread_local! {
    static MEMBER_COMPRESSOR: RefCell<Option<(i32, libdeflater::Compressor)>> =
        const { RefCell::new(None) };
}

/// Compress `block` as a raw deflate region with an empty starting
/// dictionary. Non-final blocks end with a sync flush so the regions
/// concatenate into one valid deflate stream; the final block carries the
/// stream's final-block bit.
pub(crate) fn deflate_block(block: &[u8], level: u32, last: bool) -> Result<Vec<u8>, String> {
    let mut deflater = Compress::new(Compression::new(level), false);
    let mut out = Vec::with_capacity(block.len() / 2 + 64);

    loop {
        let consumed = deflater.total_in() as usize;
        let input = &block[consumed..];
        let flush = if !input.is_empty() {
            FlushCompress::None
        } else if last {
            FlushCompress::Finish
        } else {
            FlushCompress::Sync
        };

        if out.len() == out.capacity() {
            out.reserve(32 * 1024);
        }
        let status = deflater
            .compress_vec(input, &mut out, flush)
            .map_err(|e| e.to_string())?;

        let drained = deflater.total_in() as usize == block.len();
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // A sync flush is complete once the call that returned was
                // itself a Sync call with all input consumed and output
                // space left over. Returning after the FlushCompress::None
                // call that drained the input would leave the block's tail
                // and the `00 00 FF FF` marker buffered inside zlib.
                if matches!(flush, FlushCompress::Sync) && drained && out.len() < out.capacity() {
                    break;
                }
            }
        }
    }

    Ok(out)
}

/// Compress `block` as a complete gzip member with a length marker, in the
/// style of BGZF: header, deflate payload, CRC32 + ISIZE trailer, total
/// member length patched into FEXTRA.
pub(crate) fn compress_member_block(
    block: &[u8],
    level: u32,
    info: &GzipHeaderInfo,
) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(block.len() / 2 + 128);
    let size_offset = header::write_header(&mut out, info, true);

    let level = level as i32;
    let deflate_start = out.len();
    MEMBER_COMPRESSOR.with(|cache| {
        let mut cache = cache.borrow_mut();
        if !matches!(cache.as_ref(), Some((cached, _)) if *cached == level) {
            let lvl = libdeflater::CompressionLvl::new(level)
                .map_err(|e| format!("bad compression level: {:?}", e))?;
            *cache = Some((level, libdeflater::Compressor::new(lvl)));
        }
        let (_, compressor) = cache
            .as_mut()
            .ok_or_else(|| "compressor cache empty".to_string())?;

        let bound = compressor.deflate_compress_bound(block.len());
        out.resize(deflate_start + bound, 0);
        let n = compressor
            .deflate_compress(block, &mut out[deflate_start..])
            .map_err(|e| e.to_string())?;
        out.truncate(deflate_start + n);
        Ok::<(), String>(())
    })?;

    header::write_trailer(&mut out, crc32fast::hash(block), block.len() as u32);
    let total = out.len() as u32;
    header::patch_member_len(&mut out, size_offset, total);
    Ok(out)
}

fn compress_worker(opts: &GzOptions) -> impl Fn(Job) -> WorkerResult + Send + Sync + 'static {
    let level = opts.level;
    let framing = opts.framing;
    let info = opts.header.clone();
    move |job: Job| {
        let crc32 = crc32fast::hash(&job.payload);
        let raw_len = job.payload.len() as u64;
        let compressed = match framing {
            Framing::SingleMember => deflate_block(&job.payload, level, job.is_last),
            Framing::IndependentMembers => compress_member_block(&job.payload, level, &info),
        };
        match compressed {
            Ok(output) => WorkerResult {
                seq: job.seq,
                output,
                crc32,
                raw_len,
                error: None,
            },
            Err(msg) => WorkerResult::failed(job.seq, msg),
        }
    }
}

/// Streaming parallel gzip writer.
///
/// Bytes written accumulate into one logical uncompressed payload; blocks
/// are dispatched to the pool as they fill and flushed to the inner writer
/// strictly in order. [`finish`](Self::finish) emits the final block and
/// trailer; `Drop` calls it best-effort so every exit path finalizes.
pub struct ParallelGzWriter<W: Write> {
    inner: Option<W>,
    pool: WorkerPool,
    opts: GzOptions,
    /// Bytes of the block currently filling.
    buf: Vec<u8>,
    /// Out-of-order results parked until their turn.
    reorder: BTreeMap<u64, WorkerResult>,
    next_submit: u64,
    next_flush: u64,
    checksum: StreamChecksum,
    max_in_flight: usize,
    finished: bool,
}

impl<W: Write> ParallelGzWriter<W> {
    pub fn new(mut inner: W, opts: GzOptions) -> PargzResult<Self> {
        opts.validate()?;
        let queue = opts.threads.max(1) * QUEUE_DEPTH_PER_WORKER;
        let pool = WorkerPool::new(opts.threads, queue, compress_worker(&opts));

        // Single-member framing emits its only header up front.
        if opts.framing == Framing::SingleMember {
            let mut head = Vec::new();
            header::write_header(&mut head, &opts.header, false);
            inner.write_all(&head)?;
        }

        Ok(Self {
            inner: Some(inner),
            pool,
            buf: Vec::with_capacity(opts.block_size.min(DEFAULT_BLOCK_SIZE) + 1),
            reorder: BTreeMap::new(),
            next_submit: 0,
            next_flush: 0,
            checksum: StreamChecksum::new(),
            max_in_flight: queue,
            opts,
            finished: false,
        })
    }

    /// Submit a block, draining results whenever the in-flight window fills.
    fn submit_block(&mut self, payload: Vec<u8>, is_last: bool) -> PargzResult<()> {
        let seq = self.next_submit;
        self.next_submit += 1;
        self.pool.submit(Job {
            seq,
            payload,
            is_last,
        })?;

        while self.pool.in_flight() >= self.max_in_flight {
            let result = self.pool.collect()?;
            self.reorder.insert(result.seq, result);
            self.flush_ready()?;
        }
        // Opportunistically drain whatever already completed.
        while let Some(result) = self.pool.try_collect()? {
            self.reorder.insert(result.seq, result);
        }
        self.flush_ready()
    }

    /// Write every parked result whose turn has come, in seq order.
    fn flush_ready(&mut self) -> PargzResult<()> {
        while let Some(result) = self.reorder.remove(&self.next_flush) {
            if let Some(msg) = result.error {
                return Err(PargzError::worker(result.seq, msg));
            }
            let inner = self
                .inner
                .as_mut()
                .ok_or_else(|| PargzError::resource("writer already finished"))?;
            inner.write_all(&result.output)?;
            self.checksum.push(result.crc32, result.raw_len);
            self.next_flush += 1;
        }
        Ok(())
    }

    fn finish_inner(&mut self) -> PargzResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        // The residual block is the last one. Single-member framing needs a
        // final block even for empty input so the deflate stream terminates;
        // member framing writes an empty member only when nothing was
        // written at all (so empty input still yields a valid stream).
        let residual = std::mem::take(&mut self.buf);
        let need_final = match self.opts.framing {
            Framing::SingleMember => true,
            Framing::IndependentMembers => !residual.is_empty() || self.next_submit == 0,
        };
        if need_final {
            self.submit_block(residual, true)?;
        }

        while self.pool.in_flight() > 0 {
            let result = self.pool.collect()?;
            self.reorder.insert(result.seq, result);
            self.flush_ready()?;
        }
        if self.next_flush != self.next_submit {
            return Err(PargzError::resource("worker results lost before finish"));
        }

        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| PargzError::resource("writer already finished"))?;
        if self.opts.framing == Framing::SingleMember {
            let mut trailer = Vec::with_capacity(header::TRAILER_LEN);
            header::write_trailer(&mut trailer, self.checksum.crc(), self.checksum.isize());
            inner.write_all(&trailer)?;
        }
        inner.flush()?;
        Ok(())
    }

    /// Finalize the stream: compress the residual block, drain the pool,
    /// write the trailer, and return the inner writer.
    pub fn finish(mut self) -> PargzResult<W> {
        self.finish_inner()?;
        self.inner
            .take()
            .ok_or_else(|| PargzError::resource("writer already finished"))
    }

    /// Total uncompressed bytes flushed so far.
    pub fn total_in(&self) -> u64 {
        self.checksum.total_len() + self.buf.len() as u64
    }
}

impl<W: Write> Write for ParallelGzWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.finished {
            return Err(std::io::Error::other("write after finish"));
        }
        self.buf.extend_from_slice(data);

        // Keep at least one byte back: a block is only known not to be the
        // last once a byte beyond it exists.
        while self.buf.len() > self.opts.block_size {
            let rest = self.buf.split_off(self.opts.block_size);
            let block = std::mem::replace(&mut self.buf, rest);
            self.submit_block(block, false)
                .map_err(std::io::Error::other)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // Block data may still be in flight; only the inner sink is flushed.
        if let Some(inner) = self.inner.as_mut() {
            inner.flush()?;
        }
        Ok(())
    }
}

impl<W: Write> Drop for ParallelGzWriter<W> {
    fn drop(&mut self) {
        if !self.finished && self.inner.is_some() {
            let _ = self.finish_inner();
        }
    }
}

/// Compress all of `reader` to `writer`. Returns uncompressed bytes read.
pub fn compress_stream<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    opts: &GzOptions,
) -> PargzResult<u64> {
    let mut gz = ParallelGzWriter::new(writer, opts.clone())?;
    let mut buf = vec![0u8; opts.block_size.clamp(4096, 4 * 1024 * 1024)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        gz.write_all(&buf[..n])?;
        total += n as u64;
    }
    gz.finish()?;
    Ok(total)
}

/// Compress an in-memory buffer to `writer`.
pub fn compress_buffer<W: Write>(data: &[u8], writer: W, opts: &GzOptions) -> PargzResult<u64> {
    let mut gz = ParallelGzWriter::new(writer, opts.clone())?;
    gz.write_all(data)?;
    gz.finish()?;
    Ok(data.len() as u64)
}

/// Compress a file via mmap for zero-copy block slicing.
pub fn compress_file<P: AsRef<Path>, W: Write>(
    path: P,
    writer: W,
    opts: &GzOptions,
) -> PargzResult<u64> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return compress_buffer(&[], writer, opts);
    }
    let mmap = unsafe { Mmap::map(&file)? };
    compress_buffer(&mmap, writer, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn opts(level: u32, block_size: usize, threads: usize, framing: Framing) -> GzOptions {
        GzOptions {
            level,
            block_size,
            threads,
            framing,
            header: GzipHeaderInfo::default(),
        }
    }

    fn gunzip_all(gz: &[u8]) -> Vec<u8> {
        let mut decoder = flate2::bufread::MultiGzDecoder::new(gz);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).expect("standard decoder");
        out
    }

    #[test]
    fn empty_input_is_a_valid_gzip_stream() {
        for framing in [Framing::SingleMember, Framing::IndependentMembers] {
            let mut out = Vec::new();
            compress_buffer(&[], &mut out, &opts(6, 1024, 4, framing)).unwrap();
            assert!(out.len() >= 20, "{:?}", framing);
            let (crc, isize) = crate::header::read_trailer(&out).unwrap();
            assert_eq!((crc, isize), (0, 0));
            assert_eq!(gunzip_all(&out), b"");
        }
    }

    #[test]
    fn non_last_blocks_end_with_a_sync_flush_marker() {
        // The compressed bytes and the empty-stored-block marker must be
        // fully flushed out of zlib, not left buffered after input drains.
        let region = deflate_block(&[7u8; 8192], 6, false).unwrap();
        assert!(!region.is_empty());
        assert_eq!(&region[region.len() - 4..], &[0x00, 0x00, 0xff, 0xff]);

        // Two regions concatenate into one valid deflate stream.
        let mut stream = region;
        stream.extend_from_slice(&deflate_block(&[9u8; 100], 6, true).unwrap());
        let mut inflater = flate2::Decompress::new(false);
        let mut decoded = Vec::with_capacity(16 * 1024);
        loop {
            let status = inflater
                .decompress_vec(&stream[inflater.total_in() as usize..], &mut decoded, flate2::FlushDecompress::None)
                .unwrap();
            if status == flate2::Status::StreamEnd {
                break;
            }
            if decoded.len() == decoded.capacity() {
                decoded.reserve(16 * 1024);
            }
        }
        let mut expected = vec![7u8; 8192];
        expected.extend_from_slice(&[9u8; 100]);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn standard_decoder_reads_multi_block_output() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i * 31 % 251) as u8).collect();
        for framing in [Framing::SingleMember, Framing::IndependentMembers] {
            let mut out = Vec::new();
            compress_buffer(&data, &mut out, &opts(6, 32 * 1024, 4, framing)).unwrap();
            assert_eq!(gunzip_all(&out), data, "{:?}", framing);
        }
    }

    #[test]
    fn block_size_boundary_inputs_round_trip() {
        let block = 4096usize;
        for len in [1, block - 1, block, block + 1, 2 * block, 2 * block + 1] {
            let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let mut out = Vec::new();
            compress_buffer(&data, &mut out, &opts(6, block, 3, Framing::SingleMember)).unwrap();
            assert_eq!(gunzip_all(&out), data, "len {}", len);
        }
    }

    #[test]
    fn single_member_trailer_carries_combined_crc() {
        let data = b"combined checksum check ".repeat(4000);
        let mut out = Vec::new();
        compress_buffer(&data, &mut out, &opts(6, 8 * 1024, 4, Framing::SingleMember)).unwrap();
        let (crc, isize) = crate::header::read_trailer(&out).unwrap();
        assert_eq!(crc, crc32fast::hash(&data));
        assert_eq!(isize, data.len() as u32);
    }

    #[test]
    fn output_is_deterministic_for_same_config() {
        let data = b"determinism ".repeat(50_000);
        let run = |threads: usize| {
            let mut out = Vec::new();
            compress_buffer(&data, &mut out, &opts(6, 16 * 1024, threads, Framing::SingleMember))
                .unwrap();
            out
        };
        // Identical across runs and across thread counts: framing depends on
        // block size, not scheduling.
        assert_eq!(run(4), run(4));
        assert_eq!(run(1), run(8));
    }

    #[test]
    fn member_framing_embeds_length_markers() {
        let data = vec![7u8; 100_000];
        let mut out = Vec::new();
        compress_buffer(&data, &mut out, &opts(6, 16 * 1024, 4, Framing::IndependentMembers))
            .unwrap();

        // Walk the member chain via the markers.
        let mut offset = 0;
        let mut members = 0;
        while offset < out.len() {
            let parsed = crate::header::parse_header(&out[offset..]).unwrap();
            let len = parsed.member_len.expect("marker present") as usize;
            offset += len;
            members += 1;
        }
        assert_eq!(offset, out.len());
        assert_eq!(members, 100_000usize.div_ceil(16 * 1024));
    }

    #[test]
    fn writer_accumulates_repeated_writes_into_one_payload() {
        let chunk: Vec<u8> = (0..60u8).collect();
        let mut gz = ParallelGzWriter::new(Vec::new(), opts(6, 1024, 2, Framing::SingleMember))
            .unwrap();
        for _ in 0..3 {
            gz.write_all(&chunk).unwrap();
        }
        let out = gz.finish().unwrap();
        let decoded = gunzip_all(&out);
        assert_eq!(decoded.len(), 180);
        assert_eq!(decoded, chunk.repeat(3));
    }

    #[test]
    fn drop_finalizes_the_stream() {
        let mut sink: Vec<u8> = Vec::new();
        {
            let mut gz =
                ParallelGzWriter::new(&mut sink, opts(6, 1024, 2, Framing::SingleMember)).unwrap();
            gz.write_all(b"finalized on drop").unwrap();
            // no finish(): Drop must complete the stream
        }
        assert_eq!(gunzip_all(&sink), b"finalized on drop");
    }

    #[test]
    fn rejects_bad_level_and_block_size() {
        assert!(matches!(
            compress_buffer(b"x", Vec::new(), &opts(10, 1024, 1, Framing::SingleMember)),
            Err(PargzError::InvalidLevel(10))
        ));
        assert!(compress_buffer(b"x", Vec::new(), &opts(6, 0, 1, Framing::SingleMember)).is_err());
    }

    #[test]
    fn level_zero_stores_blocks_uncompressed_but_valid() {
        let data = b"stored block framing".repeat(100);
        let mut out = Vec::new();
        compress_buffer(&data, &mut out, &opts(0, 512, 2, Framing::SingleMember)).unwrap();
        assert_eq!(gunzip_all(&out), data);
    }
}
