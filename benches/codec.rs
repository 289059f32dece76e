use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use unimidi::protocol::{Decoder, decode, encode};
use unimidi::transport::rtp::{Journal, MidiCommand, MidiPacket, RecoveryJournal, RtpHeader};
use unimidi::{MidiMessage, ShortMessage, SysexMessage};

fn bench_messages(c: &mut Criterion) {
    let mut group = c.benchmark_group("messages");

    let note = MidiMessage::Short(ShortMessage::note_on(3, 60, 100).unwrap());
    let note_bytes = encode(&note);
    group.throughput(Throughput::Bytes(note_bytes.len() as u64));
    group.bench_function("encode_note_on", |b| {
        b.iter(|| black_box(encode(black_box(&note))));
    });
    group.bench_function("decode_note_on", |b| {
        b.iter(|| black_box(decode(black_box(&note_bytes)).unwrap()));
    });

    // Dense stream of mixed channel messages
    let mut stream = Vec::new();
    for n in 0..256u16 {
        let key = (n % 128) as u8;
        encode(&MidiMessage::Short(ShortMessage::note_on(0, key, 90).unwrap()))
            .into_iter()
            .chain(encode(&MidiMessage::Short(
                ShortMessage::control_change(1, 7, key).unwrap(),
            )))
            .for_each(|byte| stream.push(byte));
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("decode_stream_512", |b| {
        b.iter(|| black_box(Decoder::new(black_box(&stream)).count()));
    });

    let payload: Vec<u8> = (0..4096u32).map(|n| (n % 0x80) as u8).collect();
    let sysex = MidiMessage::Sysex(SysexMessage::from_payload(&payload));
    let sysex_bytes = encode(&sysex);
    group.throughput(Throughput::Bytes(sysex_bytes.len() as u64));
    group.bench_function("decode_sysex_4kb", |b| {
        b.iter(|| black_box(decode(black_box(&sysex_bytes)).unwrap()));
    });

    group.finish();
}

fn bench_rtp(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtp");

    let mut journal = RecoveryJournal::new(64, 1);
    for sequence in 1..=32u16 {
        let key = (sequence % 128) as u8;
        journal.record(
            sequence,
            &[
                ShortMessage::note_on(0, key, 100).unwrap(),
                ShortMessage::control_change(0, 1, key).unwrap(),
            ],
        );
    }
    let journal_bytes = journal.encode();

    let packet = MidiPacket {
        header: RtpHeader {
            marker: false,
            sequence: 33,
            timestamp: 1_000,
            ssrc: 0x1234_5678,
        },
        commands: vec![MidiCommand::new(vec![0x90, 64, 100])],
        journal: journal_bytes.clone(),
    };
    let packet_bytes = packet.encode().unwrap();

    group.throughput(Throughput::Bytes(packet_bytes.len() as u64));
    group.bench_function("encode_packet_with_journal", |b| {
        b.iter(|| black_box(packet.encode().unwrap()));
    });
    group.bench_function("decode_packet_with_journal", |b| {
        b.iter(|| black_box(MidiPacket::decode(black_box(&packet_bytes)).unwrap()));
    });
    group.bench_function("encode_journal_32_packets", |b| {
        b.iter(|| black_box(journal.encode()));
    });
    if let Some(bytes) = journal_bytes {
        group.bench_function("decode_journal", |b| {
            b.iter(|| black_box(Journal::decode(black_box(&bytes)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_messages, bench_rtp);
criterion_main!(benches);
