//! No library surface; this crate only hosts integration tests under `tests/`.
