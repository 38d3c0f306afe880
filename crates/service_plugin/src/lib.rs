pub mod control_client;
pub mod error;
pub mod jsonrpc;
pub mod message;
pub mod peer;
pub mod plugin_runtime;
pub mod util;
pub mod worker;

#[cfg(feature = "test-utils")]
pub mod plugin_test_util;
