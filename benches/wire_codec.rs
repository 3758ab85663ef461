//! Wire Codec Benchmarks
//!
//! Measures file list encoding and decoding at typical and maximal paste
//! sizes, and the FileContentsRequest codec on the per-read hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lamco_cliprdr_files::clipboard::cursor::ReadCursor;
use lamco_cliprdr_files::clipboard::pdu::{
    ClipboardHeader, FileAttributes, FileContentsRequest, FileContentsResponse, FileDescriptor,
    FileDescriptorFlags, FileListResponse,
};

/// File list with `count` entries and mixed ASCII / non-ASCII names
fn generate_file_list(count: usize) -> FileListResponse {
    FileListResponse {
        descriptors: (0..count)
            .map(|i| FileDescriptor {
                flags: FileDescriptorFlags::ATTRIBUTES
                    | FileDescriptorFlags::FILESIZE
                    | FileDescriptorFlags::WRITESTIME
                    | FileDescriptorFlags::SHOWPROGRESSUI,
                attributes: FileAttributes::ARCHIVE,
                last_write_time: 0x01da_0000_0000_0000 + i as u64,
                file_size: (i as u64) * 4096,
                file_name: if i % 2 == 0 {
                    format!("report-{i:05}.pdf")
                } else {
                    format!("\u{65e5}\u{672c}\u{8a9e}-{i:05}.txt")
                },
            })
            .collect(),
    }
}

fn bench_file_list_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_list_encode");

    for count in [1usize, 16, 256, 4096] {
        let list = generate_file_list(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &list, |b, list| {
            b.iter(|| black_box(list.encode()))
        });
    }

    group.finish();
}

fn bench_file_list_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_list_decode");

    for count in [1usize, 16, 256, 4096] {
        let wire = generate_file_list(count)
            .encode()
            .expect("benchmark list encodes");
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &wire, |b, wire| {
            b.iter(|| {
                let mut src = ReadCursor::new(black_box(wire), "bench");
                let _ = ClipboardHeader::decode(&mut src);
                black_box(FileListResponse::decode_body(&mut src))
            })
        });
    }

    group.finish();
}

fn bench_contents_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_contents");

    let request = FileContentsRequest::range(7, 3, 65536, 65536);
    group.bench_function("request_encode", |b| {
        b.iter(|| black_box(black_box(&request).encode()))
    });

    let wire = request.encode();
    group.bench_function("request_decode", |b| {
        b.iter(|| {
            let mut src = ReadCursor::new(black_box(&wire), "bench");
            let _ = ClipboardHeader::decode(&mut src);
            black_box(FileContentsRequest::decode_body(&mut src))
        })
    });

    for size in [4096usize, 65536, 1024 * 1024] {
        let response = FileContentsResponse::Range {
            stream_id: 7,
            data: vec![0xa5; size].into(),
        };
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(
            BenchmarkId::new("range_response_encode", size),
            &response,
            |b, response| b.iter(|| black_box(response.encode())),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_file_list_encode,
    bench_file_list_decode,
    bench_contents_codec
);
criterion_main!(benches);
