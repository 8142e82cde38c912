//! Shared test infrastructure: mock transport clients.

pub mod mock_clients;

#[allow(unused_imports)]
pub use mock_clients::{MockConsumer, MockProducer, SendCall};
