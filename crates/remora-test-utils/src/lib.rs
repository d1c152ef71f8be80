// remora-test-utils: test doubles for the provider endpoint.

mod mock_provider;

pub use mock_provider::MockProviderServer;
