use std::time::Duration;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// When a write without response is reported complete to the caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WriteWithoutResponsePolicy {
    /// Resolve as soon as the write is handed to the transport.
    #[default]
    Optimistic,
    /// Resolve once the transport call itself returns.
    AwaitHandoff,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CentralConfig {
    /// Applied to any operation enqueued without its own timeout.
    pub operation_timeout: Duration,
    pub write_without_response: WriteWithoutResponsePolicy,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            write_without_response: WriteWithoutResponsePolicy::default(),
        }
    }
}

impl CentralConfig {
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_write_without_response(mut self, policy: WriteWithoutResponsePolicy) -> Self {
        self.write_without_response = policy;
        self
    }
}
