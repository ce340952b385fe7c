//! Configuration loading and validation.

mod settings;

pub use settings::{
    ContractConfig, DatabaseConfig, FactoryConfig, FilterConfig, NetworkConfig, Options, Settings,
    TransportConfig, default_block_range, default_finality,
};
