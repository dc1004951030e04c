//! Standalone throughput diagnostic, not part of the library's public
//! surface — kept as an `[[example]]` target the way the teacher repo
//! keeps its own `upload-speed` benchmark. Measures the codec's
//! compress+encrypt throughput over synthetic data, since this crate's
//! upload path has no live network server to benchmark against (the
//! client/server plumbing the teacher measured is out of scope here).

use std::time::Instant;

use bcrdf::codec::Codec;
use bcrdf::config::EncryptionAlgo;

const PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

fn synthetic_payload(size: usize) -> Vec<u8> {
    // Semi-compressible filler: repeating period so the deflate stage has
    // realistic work to do instead of compressing pure zeros trivially.
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn run(label: &str, algo: EncryptionAlgo) {
    let codec = Codec::new(&"a".repeat(64), algo, 6).expect("codec construction");
    let payload = synthetic_payload(PAYLOAD_SIZE);

    let start = Instant::now();
    let encoded = codec.encode(&payload).expect("encode");
    let encode_elapsed = start.elapsed();

    let start = Instant::now();
    let decoded = codec.decode(&encoded.bytes).expect("decode");
    let decode_elapsed = start.elapsed();

    assert_eq!(decoded, payload);

    let mb = PAYLOAD_SIZE as f64 / (1024.0 * 1024.0);
    println!(
        "{label}: encode {:.1} MB/s, decode {:.1} MB/s (compressed {:.1}% of original)",
        mb / encode_elapsed.as_secs_f64(),
        mb / decode_elapsed.as_secs_f64(),
        100.0 * encoded.compressed_size as f64 / PAYLOAD_SIZE as f64,
    );
}

fn main() {
    run("aes-256-gcm", EncryptionAlgo::Aes256Gcm);
    run("xchacha20-poly1305", EncryptionAlgo::XChaCha20Poly1305);
}
