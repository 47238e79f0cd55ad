use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use ice_agent_codec::{
    Decoder,
    attribute::{IceControlling, Priority, UserName, XorMappedAddress},
    message::MessageWriter,
    method::{Kind, Method},
};

fn criterion_benchmark(c: &mut Criterion) {
    let token = [0x21u8; 12];

    let request = {
        let mut bytes = BytesMut::with_capacity(256);
        let mut writer = MessageWriter::new(Method::Binding(Kind::Request), &token, &mut bytes);
        writer.append::<UserName>("mJw9:bEt7");
        writer.append::<Priority>(0x6e7f1eff);
        writer.append::<IceControlling>(0x4a7db6e3090bfa41);
        writer
            .flush(Some(b"x7K2mQ9pLwZ4vT8rB3nYdFhj".as_slice()))
            .unwrap();
        bytes.freeze()
    };

    let response = {
        let mut bytes = BytesMut::with_capacity(256);
        let mut writer = MessageWriter::new(Method::Binding(Kind::Response), &token, &mut bytes);
        writer.append::<XorMappedAddress>("203.0.113.4:40000".parse().unwrap());
        writer.flush(None).unwrap();
        bytes.freeze()
    };

    let mut decoder = Decoder::default();
    let mut samples = [request.as_ref(), response.as_ref()].into_iter().cycle();

    let mut stun_criterion = c.benchmark_group("stun");

    stun_criterion.throughput(Throughput::Elements(1));
    stun_criterion.bench_function("decode_messages", |bencher| {
        bencher.iter(|| {
            decoder.decode(samples.next().unwrap()).unwrap();
        })
    });

    stun_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
