//! Node-side plumbing for the stratum concurrency core: the file-backed redo
//! log, the fjall-backed data storage broker, the in-process mesh transport,
//! and the cluster/workload wiring shared by the binary and the integration
//! tests.

pub mod mesh;
pub mod node;
pub mod storage;
pub mod wal_file;
