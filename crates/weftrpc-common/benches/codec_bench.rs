// Criterion benchmarks for the weftrpc-common codecs
//
// Run benchmarks with:
//   cargo bench -p weftrpc-common
//
// For detailed output with plots:
//   cargo bench -p weftrpc-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use weftrpc_common::codec::binary::{BinaryFormatter, BinaryParser};
use weftrpc_common::codec::json::{JsonFormatter, JsonParser};
use weftrpc_common::codec::xml::{XmlFormatter, XmlParser};
use weftrpc_common::codec::{from_bytes, to_bytes, Parser};
use weftrpc_common::Node;

fn sample(size: usize) -> Node {
    let mut root = Node::new();
    root.add_member("name").set_value("benchmark");
    root.add_member("ok").set_value(true);
    let items = root.add_member("items");
    for i in 0..size {
        let item = items.add_member("");
        item.add_member("id").set_value(i as i64);
        item.add_member("label").set_value(format!("item_{}", i));
        item.add_member("score").set_value(i as f64 * 0.5);
    }
    root
}

fn byte_at_a_time<P: Parser>(parser: &mut P, data: &[u8]) -> Option<P::Output> {
    parser.reset();
    for &b in data {
        if parser.advance(b).ok()? {
            break;
        }
    }
    parser.finish().ok()?;
    parser.take()
}

fn bench_parse<P: Parser>(c: &mut Criterion, name: &str, mut make: impl FnMut() -> P, bytes: impl Fn(&Node) -> Vec<u8>) {
    let mut group = c.benchmark_group(name);
    for size in [1usize, 10, 100] {
        let data = bytes(&sample(size));
        group.throughput(Throughput::Bytes(data.len() as u64));

        group.bench_with_input(BenchmarkId::new("whole_buffer", size), &data, |b, data| {
            let mut parser = make();
            b.iter(|| from_bytes(&mut parser, black_box(data)).ok());
        });

        group.bench_with_input(BenchmarkId::new("byte_at_a_time", size), &data, |b, data| {
            let mut parser = make();
            b.iter(|| byte_at_a_time(&mut parser, black_box(data)));
        });
    }
    group.finish();
}

fn bench_binary(c: &mut Criterion) {
    bench_parse(c, "binary_parse", BinaryParser::new, |node| {
        to_bytes(&mut BinaryFormatter::new(), node).unwrap_or_default()
    });
}

fn bench_json(c: &mut Criterion) {
    bench_parse(c, "json_parse", JsonParser::new, |node| {
        to_bytes(&mut JsonFormatter::new(), node).unwrap_or_default()
    });
}

fn bench_xml(c: &mut Criterion) {
    bench_parse(c, "xml_parse", XmlParser::new, |node| {
        to_bytes(&mut XmlFormatter::new(), node).unwrap_or_default()
    });
}

fn bench_format(c: &mut Criterion) {
    let mut group = c.benchmark_group("format");
    let node = sample(100);

    group.bench_function("binary", |b| {
        b.iter(|| to_bytes(&mut BinaryFormatter::new(), black_box(&node)))
    });
    group.bench_function("json", |b| {
        b.iter(|| to_bytes(&mut JsonFormatter::new(), black_box(&node)))
    });
    group.bench_function("json_beautify", |b| {
        b.iter(|| to_bytes(&mut JsonFormatter::new().beautify(true), black_box(&node)))
    });
    group.bench_function("xml", |b| {
        b.iter(|| to_bytes(&mut XmlFormatter::new(), black_box(&node)))
    });

    group.finish();
}

criterion_group!(benches, bench_binary, bench_json, bench_xml, bench_format);
criterion_main!(benches);
