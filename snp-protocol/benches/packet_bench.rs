use criterion::{black_box, criterion_group, criterion_main, Criterion};
use snp_crypto::{random_array, MacKey};
use snp_protocol::packet::{flags, HeaderFields, PacketBuilder, PacketType, PacketView};
use snp_protocol::replay::TransmitBuffer;
use snp_protocol::session::SessionId;
use snp_protocol::TransmitId;

fn header_fields() -> HeaderFields {
    HeaderFields {
        app_id: 1,
        app_version: 1,
        flags: flags::RELIABLE | flags::ENCRYPTED,
        packet_type: PacketType::Message,
        uid: 1000,
        session_id: SessionId::from_bytes([7u8; 16]),
        iv: random_array(),
    }
}

fn bench_packet_build(c: &mut Criterion) {
    let fields = header_fields();
    let payload = vec![0u8; 1024]; // Typical payload size
    let key = MacKey::new(random_array());

    c.bench_function("packet_build_sealed", |b| {
        b.iter(|| {
            let wire = PacketBuilder::new(black_box(&fields))
                .payload(black_box(&payload))
                .unwrap()
                .seal(Some(&key));
            black_box(wire);
        });
    });

    c.bench_function("packet_build_with_data_hmac", |b| {
        b.iter(|| {
            let wire = PacketBuilder::new(black_box(&fields))
                .payload(black_box(&payload))
                .unwrap()
                .data_hmac(&key)
                .seal(Some(&key));
            black_box(wire);
        });
    });
}

fn bench_packet_parse(c: &mut Criterion) {
    let key = MacKey::new(random_array());
    let wire = PacketBuilder::new(&header_fields())
        .payload(&vec![0u8; 1024])
        .unwrap()
        .data_hmac(&key)
        .seal(Some(&key));

    c.bench_function("packet_parse", |b| {
        b.iter(|| {
            let view = PacketView::new(black_box(&wire)).unwrap();
            black_box(view.transmit_id());
        });
    });

    c.bench_function("packet_verify_crc", |b| {
        let view = PacketView::new(&wire).unwrap();
        b.iter(|| {
            black_box(view.crc_valid());
        });
    });

    c.bench_function("packet_verify_header_hmac", |b| {
        let view = PacketView::new(&wire).unwrap();
        b.iter(|| {
            black_box(view.verify_header_hmac(&key));
        });
    });
}

fn bench_replay_buffer(c: &mut Criterion) {
    c.bench_function("transmit_buffer_update", |b| {
        let mut buf = TransmitBuffer::default();
        let mut uid = 0u32;
        b.iter(|| {
            uid = uid.wrapping_add(1);
            black_box(buf.update(TransmitId::new(uid, 0xdead_beef)));
        });
    });
}

criterion_group!(
    benches,
    bench_packet_build,
    bench_packet_parse,
    bench_replay_buffer
);
criterion_main!(benches);
