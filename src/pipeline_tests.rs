//! End-to-end pipeline scenarios: writer/reader pairings against a
//! standard sequential gzip implementation, ordering under artificial
//! worker delay, and the file-handle surface.

use std::io::{BufRead, Read, Write};

use crate::compress::{compress_buffer, Framing, GzOptions};
use crate::decompress::{decompress_buffer, ParallelGzReader};
use crate::pool::{Job, WorkerPool, WorkerResult};
use crate::{open_append, open_read, open_write, ParallelGzWriter};

const GREETING: &str = "Hello, World!\nThis is a test";

fn opts(framing: Framing, block_size: usize, threads: usize) -> GzOptions {
    GzOptions {
        level: 6,
        block_size,
        threads,
        framing,
        header: Default::default(),
    }
}

fn engine_compress(data: &[u8], framing: Framing) -> Vec<u8> {
    let mut out = Vec::new();
    compress_buffer(data, &mut out, &opts(framing, 8 * 1024, 4)).unwrap();
    out
}

fn engine_decompress(gz: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    decompress_buffer(gz, &mut out, 4).unwrap();
    out
}

fn std_compress(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn std_decompress(gz: &[u8]) -> Vec<u8> {
    let mut dec = flate2::bufread::MultiGzDecoder::new(gz);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn greeting_engine_writer_standard_reader() {
    for framing in [Framing::SingleMember, Framing::IndependentMembers] {
        let gz = engine_compress(GREETING.as_bytes(), framing);
        assert_eq!(std_decompress(&gz), GREETING.as_bytes());
    }
}

#[test]
fn greeting_standard_writer_engine_reader() {
    let gz = std_compress(GREETING.as_bytes());
    assert_eq!(engine_decompress(&gz), GREETING.as_bytes());
}

#[test]
fn greeting_engine_writer_engine_reader() {
    for framing in [Framing::SingleMember, Framing::IndependentMembers] {
        let gz = engine_compress(GREETING.as_bytes(), framing);
        assert_eq!(engine_decompress(&gz), GREETING.as_bytes());
    }
}

#[test]
fn three_writes_one_payload() {
    let chunk: String = "x0123456789".chars().cycle().take(60).collect();
    let mut gz = ParallelGzWriter::new(Vec::new(), opts(Framing::SingleMember, 128, 2)).unwrap();
    for _ in 0..3 {
        gz.write_all(chunk.as_bytes()).unwrap();
    }
    let compressed = gz.finish().unwrap();

    let payload = engine_decompress(&compressed);
    assert_eq!(payload.len(), 180);
    assert_eq!(payload, chunk.repeat(3).into_bytes());
}

#[test]
fn multi_block_round_trip_survives_standard_reader() {
    // Enough data for many blocks, compressible but not trivial.
    let mut data = Vec::new();
    for i in 0..50_000u32 {
        data.extend_from_slice(format!("record {:08}\n", i.wrapping_mul(2654435761)).as_bytes());
    }
    for framing in [Framing::SingleMember, Framing::IndependentMembers] {
        let gz = engine_compress(&data, framing);
        assert_eq!(std_decompress(&gz), data);
        assert_eq!(engine_decompress(&gz), data);
    }
}

#[test]
fn output_order_is_stable_under_worker_delay() {
    // Slow down early-sequence jobs so later jobs complete first, then
    // check that in-order draining still reassembles correctly.
    let mut pool = WorkerPool::new(4, 8, |job: Job| {
        if job.seq < 3 {
            std::thread::sleep(std::time::Duration::from_millis(40 - 10 * job.seq));
        }
        WorkerResult {
            seq: job.seq,
            crc32: 0,
            raw_len: job.payload.len() as u64,
            output: job.payload,
            error: None,
        }
    });

    let blocks: Vec<Vec<u8>> = (0..12u8).map(|i| vec![i; 16]).collect();
    for (seq, block) in blocks.iter().enumerate() {
        pool.submit(Job {
            seq: seq as u64,
            payload: block.clone(),
            is_last: seq == blocks.len() - 1,
        })
        .unwrap();
    }

    let mut results = std::collections::BTreeMap::new();
    while pool.in_flight() > 0 {
        let r = pool.collect().unwrap();
        results.insert(r.seq, r.output);
    }
    pool.shutdown();

    let reassembled: Vec<u8> = results.into_values().flatten().collect();
    let expected: Vec<u8> = blocks.into_iter().flatten().collect();
    assert_eq!(reassembled, expected);
}

#[test]
fn file_handles_round_trip() {
    let dir = std::env::temp_dir().join(format!("pargz-handle-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("greeting.gz");

    {
        let mut handle = open_write(&path, opts(Framing::SingleMember, 4096, 2)).unwrap();
        handle.write_all(GREETING.as_bytes()).unwrap();
        handle.finish().unwrap();
    }
    let mut reader = open_read(&path, 2).unwrap();
    let mut text = String::new();
    reader.read_to_string(&mut text).unwrap();
    assert_eq!(text, GREETING);

    // Write mode truncates.
    {
        let mut handle = open_write(&path, opts(Framing::SingleMember, 4096, 2)).unwrap();
        handle.write_all(b"replaced").unwrap();
        handle.finish().unwrap();
    }
    assert_eq!(open_read(&path, 2).unwrap().into_inner(), b"replaced");

    // Append mode adds a member; readers see the concatenation.
    {
        let mut handle = open_append(&path, opts(Framing::SingleMember, 4096, 2)).unwrap();
        handle.write_all(b" and appended").unwrap();
        handle.finish().unwrap();
    }
    assert_eq!(
        open_read(&path, 2).unwrap().into_inner(),
        b"replaced and appended"
    );

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn reader_lines_iterate_text() {
    let gz = engine_compress(b"one\ntwo\nthree", Framing::SingleMember);
    let reader = ParallelGzReader::from_reader(&gz[..], 2).unwrap();
    let lines: Vec<String> = reader.lines().map(|l| l.unwrap()).collect();
    assert_eq!(lines, ["one", "two", "three"]);
}

#[test]
fn dropped_writer_still_produces_a_valid_stream() {
    let mut sink = Vec::new();
    {
        let mut gz =
            ParallelGzWriter::new(&mut sink, opts(Framing::SingleMember, 1024, 2)).unwrap();
        gz.write_all(b"finalized by drop").unwrap();
        // No finish(); Drop must complete the trailer.
    }
    assert_eq!(std_decompress(&sink), b"finalized by drop");
}
