use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use astflow::LogParser;

/// Synthetic log: one complete call flow per iteration, distinct call-ids
/// and channels so the arenas and linking maps actually grow.
fn synthetic_log(calls: usize) -> Vec<u8> {
    let mut log = String::new();
    for i in 0..calls {
        let sec = i % 60;
        log.push_str(&format!(
            "[2024-01-01 10:{:02}:{:02}] VERBOSE[9][C-{:08}] chan_sip.c: Reliably Transmitting (no NAT) to 10.0.0.1:5060:\n\
             INVITE sip:bob{i}@10.0.0.1 SIP/2.0\n\
             From: \"Alice\" <sip:1{i:03}@h>\n\
             To: <sip:2{i:03}@10.0.0.1>\n\
             Call-ID: call-{i}@h\n\
             CSeq: 1 INVITE\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK{i}\n\
             \n\
             <------------->\n\
             <--- SIP read from UDP:10.0.0.1:5060 --->\n\
             SIP/2.0 200 OK\n\
             Call-ID: call-{i}@h\n\
             CSeq: 1 INVITE\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK{i}\n\
             \n\
             <------------->\n\
             [2024-01-01 10:{:02}:{:02}] VERBOSE[9][C-{:08}] pbx.c: -- Executing [1{i:03}@ctx:1] Dial(\"SIP/a{i}-1\", \"SIP/b{i}&SIP/c{i},20\")\n\
             [2024-01-01 10:{:02}:{:02}] VERBOSE[9][C-{:08}] app_dial.c: -- SIP/b{i}-1 is ringing\n\
             [2024-01-01 10:{:02}:{:02}] VERBOSE[9][C-{:08}] app_dial.c: -- SIP/b{i}-1 answered SIP/a{i}-1\n",
            i / 60,
            sec,
            i,
            i / 60,
            sec,
            i,
            i / 60,
            sec,
            i,
            i / 60,
            sec,
            i,
        ));
    }
    log.into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let data = synthetic_log(500);
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("full_call_flows", |b| {
        b.iter(|| LogParser::from_bytes(black_box(data.as_slice())))
    });
    group.finish();

    let parser = LogParser::from_bytes(data.as_slice());
    c.bench_function("linked_objects", |b| {
        b.iter(|| parser.get_linked_objects(black_box(b"1042"), None))
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
