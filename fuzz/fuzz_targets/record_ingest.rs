#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use strand_adapter::feed::RecordSink;
use strand_adapter::{AdapterConfig, Cluster, LocalSocket, MemoryLocalAdapter};
use strand_codec::decode_record_cbor;
use strand_core::{LogPosition, NamespaceName, OriginId};
use strand_log::MemoryLog;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = decode_record_cbor(data) else {
        return;
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    runtime.block_on(async {
        let log = Arc::new(MemoryLog::new());
        let cluster = Cluster::new(
            log,
            AdapterConfig::default().with_uid(OriginId::new("fuzz-node")),
        );
        let local = Arc::new(MemoryLocalAdapter::new().with_recovery(true));
        local.connect(LocalSocket::new("s1").in_rooms(["r1"]));
        let adapter = cluster.attach(NamespaceName::default(), local).await;
        adapter.on_record(LogPosition(1), record).await;
        cluster.close().await;
    });
});
