use std::fmt;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route policy tracing through the test harness so state transitions show up
/// in captured test output. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Simple downstream error used across the integration tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl TestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}
