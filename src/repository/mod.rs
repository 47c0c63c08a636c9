pub mod address_registry;

pub use address_registry::{AddressRegistry, InMemoryAddressRegistry, PgAddressRegistry};
