//! TestContext - owns the temporary directory a test runs in

use std::path::Path;
use tempfile::TempDir;

/// Temporary directory for one test, removed on drop
///
/// Keep the context alive for as long as any storage environment opened
/// under [`path`](Self::path) is in use.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Directory of this context
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Subdirectory of this context, created if missing
    pub fn subdir(&self, name: &str) -> std::path::PathBuf {
        let path = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&path).expect("Failed to create test subdirectory");
        path
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
