//! Common test utilities for ftrace-mux integration tests.

pub mod fakes;
#[allow(unused_imports)]
pub use fakes::*;

use ftrace_mux::{FtraceConfig, FtraceConfigMuxer, VendorEvents};

pub type FakeMuxer = FtraceConfigMuxer<FakeBackend, FakeAtrace, FakeTable>;

pub fn muxer() -> FakeMuxer {
    muxer_with(FakeBackend::new(), FakeAtrace::new(), table())
}

pub fn muxer_with(backend: FakeBackend, atrace: FakeAtrace, table: FakeTable) -> FakeMuxer {
    FtraceConfigMuxer::new(
        backend,
        atrace,
        table,
        syscalls(),
        VendorEvents::new(),
        false,
    )
}

pub fn config(json: &str) -> FtraceConfig {
    match FtraceConfig::from_json(json) {
        Ok(config) => config,
        Err(e) => panic!("bad test config {}: {:#}", json, e),
    }
}
