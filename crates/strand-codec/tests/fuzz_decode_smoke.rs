use std::panic;

use serde_json::json;
use strand_codec::{decode_record_cbor, encode_record_cbor, EventPayload, EventRecord};
use strand_core::{BroadcastOptions, NamespaceName, OriginId, Packet, RequestId};

fn xorshift64(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut s = seed.max(1);
    let mut out = vec![0_u8; len];
    for b in &mut out {
        *b = (xorshift64(&mut s) & 0xFF) as u8;
    }
    out
}

fn sample_record() -> EventRecord {
    EventRecord {
        origin: OriginId::new("3f9c2a71d04be851"),
        namespace: NamespaceName::from("/"),
        created_at: Some(1_700_000_000_000),
        payload: EventPayload::Broadcast {
            packet: Packet::event("/", "tick", vec![json!([1, 2, 3]), json!({"k": null})]),
            opts: BroadcastOptions::default().to("room-1").volatile(),
            request_id: Some(RequestId::new("0011223344556677")),
        },
    }
}

#[test]
fn fuzz_like_random_inputs_do_not_panic_decoder() {
    for i in 0..2000_u64 {
        let len = ((i as usize) * 73) % 2048;
        let data = random_bytes(0xBAD5EED ^ i, len);

        let decoded = panic::catch_unwind(|| decode_record_cbor(&data));
        assert!(decoded.is_ok(), "decode_record_cbor panicked at case {i}");
    }
}

#[test]
fn fuzz_like_mutations_of_valid_record_do_not_panic() {
    let mut bytes = encode_record_cbor(&sample_record()).expect("record should encode");

    for i in 0..512_usize {
        let idx = i % bytes.len();
        bytes[idx] ^= (i as u8).wrapping_mul(31).wrapping_add(1);
        let data = bytes.clone();

        let decoded = panic::catch_unwind(|| decode_record_cbor(&data));
        assert!(
            decoded.is_ok(),
            "decode_record_cbor panicked for mutated record at case {i}",
        );
    }
}
