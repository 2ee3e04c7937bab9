#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

/// Route crate logs through the test writer; `RUST_LOG` overrides the `warn` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A scratch directory that lives for the rest of the test binary.
pub fn scratch_dir() -> PathBuf {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().to_path_buf();
    // Leak the tempdir so files persist for the duration of the test binary.
    std::mem::forget(dir);
    path
}

pub fn unique_db_path(prefix: &str) -> String {
    scratch_dir()
        .join(format!("{prefix}.db"))
        .to_string_lossy()
        .into_owned()
}
