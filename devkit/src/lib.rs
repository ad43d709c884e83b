/*!
# Synthetic Bridge DevKit - stubs and helpers for testing the fleet

- In-memory lookup / collection services with scripted failures
- An axum stub server speaking the HTTP wire contract
- A test harness wiring a temporary pool file, mocks and configuration
*/

pub mod http_stub;
pub mod service_stub;
pub mod test_utils;

pub use http_stub::StubServer;
pub use service_stub::{MockCollectionService, MockLookupService, MockServices, Operation};
pub use test_utils::TestHarness;
