#![no_main]

use libfuzzer_sys::fuzz_target;
use strand_codec::{decode_record_cbor, encode_record_cbor};

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = decode_record_cbor(data) {
        let encoded = encode_record_cbor(&record).expect("decoded record should re-encode");
        let again = decode_record_cbor(&encoded).expect("re-encoded record should decode");
        assert_eq!(record.kind(), again.kind());
        assert_eq!(record.origin, again.origin);
    }
});
