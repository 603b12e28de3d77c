//! Benchmark harness crate; see `benches/select_fast_path.rs`.
