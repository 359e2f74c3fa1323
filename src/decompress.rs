//! Parallel gzip decompression pipeline.
//!
//! Strategy selection, in order of preference:
//!
//! 1. **Marked members**: the first member carries our FEXTRA length
//!    marker, so member boundaries are recovered without inflating and each
//!    member becomes one pool job (libdeflate decode, per-member CRC32 +
//!    ISIZE validated against its trailer).
//! 2. **Sync-flush points**: a single member whose deflate payload
//!    contains `00 00 FF FF` markers splits at the marker ends; each
//!    segment decodes as raw deflate with a fresh dictionary. The markers
//!    are heuristic (the byte pattern can occur inside compressed data), so
//!    the result is validated against the trailer's combined CRC32 and any
//!    failure falls back to the sequential path. Correctness is never
//!    sacrificed for parallelism.
//! 3. **Sequential fallback**: flate2's MultiGzDecoder handles anything a
//!    single-threaded encoder can produce, including concatenated members
//!    with full-history back-references.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::{Decompress, FlushDecompress, Status};
use memmap2::Mmap;

use crate::checksum::StreamChecksum;
use crate::error::{PargzError, PargzResult};
use crate::header::{self, TRAILER_LEN};
use crate::pool::{Job, WorkerPool, WorkerResult};

/// The byte pattern a deflate sync flush leaves behind: an empty stored
/// block, byte-aligned.
const SYNC_FLUSH_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Below this many independent units, thread coordination costs more than
/// it buys; decode sequentially.
const MIN_PARALLEL_UNITS: usize = 2;

/// Decompress a gzip stream held in memory, writing the payload to
/// `writer`. Returns the number of uncompressed bytes written.
pub fn decompress_buffer<W: Write>(data: &[u8], writer: &mut W, threads: usize) -> PargzResult<u64> {
    let parsed = header::parse_header(data)?;

    if threads > 1 {
        if parsed.member_len.is_some() {
            match split_marked_members(data) {
                Some(members) if members.len() >= MIN_PARALLEL_UNITS => {
                    return decompress_members_parallel(data, &members, writer, threads);
                }
                _ => {}
            }
        } else if !has_second_member(data) {
            // Single member: try splitting at sync-flush points.
            if let Some(written) =
                decompress_sync_flush_parallel(data, parsed.data_start, writer, threads)?
            {
                return Ok(written);
            }
        }
    }

    decompress_sequential(data, writer)
}

/// Decompress a file, mmapped for zero-copy access.
pub fn decompress_file<P: AsRef<Path>, W: Write>(
    path: P,
    writer: &mut W,
    threads: usize,
) -> PargzResult<u64> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(PargzError::truncated("empty file is not a gzip stream"));
    }
    let mmap = unsafe { Mmap::map(&file)? };
    decompress_buffer(&mmap, writer, threads)
}

/// Fast scan for a second gzip member header anywhere past the first.
/// False positives are harmless: they only route to the sequential path.
fn has_second_member(data: &[u8]) -> bool {
    const SCAN_LIMIT: usize = 4 * 1024 * 1024;
    let end = data.len().min(SCAN_LIMIT);
    if end <= header::FIXED_HEADER_LEN {
        return false;
    }
    memchr::memmem::find_iter(&data[header::FIXED_HEADER_LEN..end], &[0x1f, 0x8b, 0x08])
        .next()
        .is_some()
}

/// One member located by the FEXTRA length markers.
struct MemberSpan {
    start: usize,
    len: usize,
}

/// Walk the member chain via the length markers. Returns None when any
/// member lacks a marker (mixed producers; use the sequential path).
/// A chain that runs past the end of the buffer means the final member was
/// cut off mid-write.
fn split_marked_members(data: &[u8]) -> Option<Vec<MemberSpan>> {
    let mut members = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let parsed = header::parse_header(&data[offset..]).ok()?;
        let len = parsed.member_len? as usize;
        if len < header::FIXED_HEADER_LEN + TRAILER_LEN {
            return None;
        }
        members.push(MemberSpan { start: offset, len });
        offset += len;
    }
    Some(members)
}

/// Decode marked members on the pool, one job per member, reassembling in
/// input order. Each member's CRC32 and ISIZE are checked against its own
/// trailer; a mismatch is fatal, not a fallback (the markers came from the
/// producer, so a bad member is corruption, not a mis-split).
fn decompress_members_parallel<W: Write>(
    data: &[u8],
    members: &[MemberSpan],
    writer: &mut W,
    threads: usize,
) -> PargzResult<u64> {
    // Truncated final member: the marker chain says more bytes than exist.
    if let Some(last) = members.last() {
        if last.start + last.len > data.len() {
            return Err(PargzError::truncated(format!(
                "final member needs {} bytes, only {} remain",
                last.len,
                data.len() - last.start
            )));
        }
    }

    let mut pool = WorkerPool::new(threads, threads * 2, |job: Job| {
        match gunzip_member(&job.payload) {
            Ok(output) => WorkerResult {
                seq: job.seq,
                crc32: crc32fast::hash(&output),
                raw_len: output.len() as u64,
                output,
                error: None,
            },
            Err(msg) => WorkerResult::failed(job.seq, msg),
        }
    });

    let mut reorder = std::collections::BTreeMap::new();
    let mut next_flush = 0u64;
    let mut total = 0u64;
    let mut write_ready = |reorder: &mut std::collections::BTreeMap<u64, WorkerResult>,
                           next_flush: &mut u64,
                           writer: &mut W,
                           total: &mut u64|
     -> PargzResult<()> {
        while let Some(result) = reorder.remove(next_flush) {
            if let Some(msg) = result.error {
                return Err(PargzError::worker(result.seq, msg));
            }
            let span = &members[result.seq as usize];
            let (want_crc, want_isize) = header::read_trailer(&data[span.start..span.start + span.len])?;
            if result.crc32 != want_crc {
                return Err(PargzError::integrity(format!(
                    "member {} CRC32 mismatch: trailer {:#010x}, computed {:#010x}",
                    result.seq, want_crc, result.crc32
                )));
            }
            if result.raw_len as u32 != want_isize {
                return Err(PargzError::integrity(format!(
                    "member {} length mismatch: trailer {}, decoded {}",
                    result.seq, want_isize, result.raw_len
                )));
            }
            writer.write_all(&result.output)?;
            *total += result.raw_len;
            *next_flush += 1;
        }
        Ok(())
    };

    for (seq, span) in members.iter().enumerate() {
        pool.submit(Job {
            seq: seq as u64,
            payload: data[span.start..span.start + span.len].to_vec(),
            is_last: seq == members.len() - 1,
        })?;
        while let Some(result) = pool.try_collect()? {
            reorder.insert(result.seq, result);
        }
        write_ready(&mut reorder, &mut next_flush, writer, &mut total)?;
    }
    while pool.in_flight() > 0 {
        let result = pool.collect()?;
        reorder.insert(result.seq, result);
        write_ready(&mut reorder, &mut next_flush, writer, &mut total)?;
    }
    pool.shutdown();

    writer.flush()?;
    Ok(total)
}

/// Decode one complete gzip member with libdeflate, growing the output
/// buffer from the trailer's ISIZE hint.
fn gunzip_member(member: &[u8]) -> Result<Vec<u8>, String> {
    let (_, isize) = header::read_trailer(member).map_err(|e| e.to_string())?;
    let mut out = vec![0u8; (isize as usize).max(4096)];
    let mut decompressor = libdeflater::Decompressor::new();
    loop {
        match decompressor.gzip_decompress(member, &mut out) {
            Ok(n) => {
                out.truncate(n);
                return Ok(out);
            }
            Err(libdeflater::DecompressionError::InsufficientSpace) => {
                // ISIZE lied (or wrapped); grow and retry.
                let grown = out.len().saturating_mul(2).max(64 * 1024);
                out.resize(grown, 0);
            }
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Try parallel decode of a single member by splitting at sync-flush
/// markers. Returns Ok(None) when the stream has no usable split points or
/// validation failed and the caller should decode sequentially.
fn decompress_sync_flush_parallel<W: Write>(
    data: &[u8],
    data_start: usize,
    writer: &mut W,
    threads: usize,
) -> PargzResult<Option<u64>> {
    if data.len() < data_start + TRAILER_LEN {
        return Ok(None); // too short to even hold a trailer; sequential reports it
    }
    let payload = &data[data_start..data.len() - TRAILER_LEN];
    let (want_crc, want_isize) = header::read_trailer(data)?;

    // Segment starts: offset 0 plus the byte after each flush marker.
    let mut starts = vec![0usize];
    for pos in memchr::memmem::find_iter(payload, &SYNC_FLUSH_MARKER) {
        let next = pos + SYNC_FLUSH_MARKER.len();
        if next < payload.len() {
            starts.push(next);
        }
    }
    if starts.len() < MIN_PARALLEL_UNITS {
        return Ok(None);
    }

    let mut pool = WorkerPool::new(threads, threads * 2, |job: Job| {
        match inflate_raw_segment(&job.payload, job.is_last) {
            Ok(output) => WorkerResult {
                seq: job.seq,
                crc32: crc32fast::hash(&output),
                raw_len: output.len() as u64,
                output,
                error: None,
            },
            Err(msg) => WorkerResult::failed(job.seq, msg),
        }
    });

    // Collect everything before writing: a failed or mis-split segment must
    // leave the writer untouched so the sequential path can run cleanly.
    let count = starts.len();
    let mut results: Vec<Option<WorkerResult>> = (0..count).map(|_| None).collect();
    let mut bad_segment = false;
    for (seq, &start) in starts.iter().enumerate() {
        let end = starts.get(seq + 1).copied().unwrap_or(payload.len());
        pool.submit(Job {
            seq: seq as u64,
            payload: payload[start..end].to_vec(),
            is_last: seq == count - 1,
        })?;
        while let Some(result) = pool.try_collect()? {
            bad_segment |= result.error.is_some();
            let seq = result.seq as usize;
            results[seq] = Some(result);
        }
    }
    while pool.in_flight() > 0 {
        let result = pool.collect()?;
        bad_segment |= result.error.is_some();
        let seq = result.seq as usize;
        results[seq] = Some(result);
    }
    pool.shutdown();
    if bad_segment {
        return Ok(None); // likely a marker false positive
    }

    let mut checksum = StreamChecksum::new();
    for result in results.iter().flatten() {
        checksum.push(result.crc32, result.raw_len);
    }
    if checksum.crc() != want_crc || checksum.isize() != want_isize {
        return Ok(None);
    }

    let mut total = 0u64;
    for result in results.into_iter().flatten() {
        writer.write_all(&result.output)?;
        total += result.raw_len;
    }
    writer.flush()?;
    Ok(Some(total))
}

/// Inflate one raw deflate segment with an empty starting dictionary.
///
/// Non-final segments end at a sync flush, so the stream simply runs out of
/// input without a final block; the last segment must reach StreamEnd.
fn inflate_raw_segment(segment: &[u8], is_last: bool) -> Result<Vec<u8>, String> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(segment.len().saturating_mul(4).max(4096));

    loop {
        let consumed = inflater.total_in() as usize;
        let input = &segment[consumed..];
        if out.len() == out.capacity() {
            out.reserve(64 * 1024);
        }
        let status = inflater
            .decompress_vec(input, &mut out, FlushDecompress::None)
            .map_err(|e| e.to_string())?;

        let drained = inflater.total_in() as usize == segment.len();
        match status {
            Status::StreamEnd => {
                if !drained {
                    return Err("final block before end of segment".into());
                }
                return Ok(out);
            }
            Status::Ok | Status::BufError => {
                if drained && out.len() < out.capacity() {
                    if is_last {
                        return Err("segment ended without a final block".into());
                    }
                    return Ok(out);
                }
                if status == Status::BufError && !drained && out.len() < out.capacity() {
                    // No progress possible: corrupt segment.
                    return Err("inflate stalled mid-segment".into());
                }
            }
        }
    }
}

/// Sequential streaming decode of one or more concatenated members.
/// Handles arbitrary RFC 1952 producers; validation is zlib's own.
pub fn decompress_sequential<W: Write>(data: &[u8], writer: &mut W) -> PargzResult<u64> {
    let mut decoder = flate2::bufread::MultiGzDecoder::new(data);
    let mut buf = vec![0u8; 256 * 1024];
    let mut total = 0u64;

    loop {
        match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                writer.write_all(&buf[..n])?;
                total += n as u64;
            }
            Err(e) => return Err(classify_decode_error(e)),
        }
    }

    writer.flush()?;
    Ok(total)
}

/// Map zlib/flate2 stream errors onto the crate taxonomy: EOF before the
/// trailer is truncation, checksum/length complaints are integrity, other
/// corruption is a format error.
fn classify_decode_error(e: std::io::Error) -> PargzError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => PargzError::truncated(e.to_string()),
        std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
            let msg = e.to_string();
            let lower = msg.to_lowercase();
            if lower.contains("checksum") || lower.contains("crc") || lower.contains("length") {
                PargzError::integrity(msg)
            } else {
                PargzError::format(msg)
            }
        }
        _ => PargzError::Io(e),
    }
}

/// Read side of the file-handle surface: decodes the whole stream up
/// front (using the parallel paths when the framing allows) and serves it
/// back through Read and BufRead, so callers get line iteration for free.
pub struct ParallelGzReader {
    cursor: std::io::Cursor<Vec<u8>>,
}

impl ParallelGzReader {
    /// Open and decode a gzip file, mmapped.
    pub fn open<P: AsRef<Path>>(path: P, threads: usize) -> PargzResult<Self> {
        let mut payload = Vec::new();
        decompress_file(path, &mut payload, threads)?;
        Ok(ParallelGzReader {
            cursor: std::io::Cursor::new(payload),
        })
    }

    /// Decode a gzip stream from any reader.
    pub fn from_reader<R: Read>(mut reader: R, threads: usize) -> PargzResult<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let mut payload = Vec::new();
        decompress_buffer(&data, &mut payload, threads)?;
        Ok(ParallelGzReader {
            cursor: std::io::Cursor::new(payload),
        })
    }

    /// Total uncompressed size.
    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    /// Consume the reader and return the full payload.
    pub fn into_inner(self) -> Vec<u8> {
        self.cursor.into_inner()
    }
}

impl Read for ParallelGzReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl std::io::BufRead for ParallelGzReader {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.cursor.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.cursor.consume(amt)
    }
}
