pub mod mock;
pub mod registry;

pub use mock::{MockLiveConnection, MockModel, MockResponse};
pub use registry::{ModelFactory, ModelRegistry};
