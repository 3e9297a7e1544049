pub mod gateway;
pub mod loader;

pub use gateway::{
    BackendSpec, GatewayConfig, HttpSpec, LaunchTarget, Mode, StdioSpec, TransportKind,
    TransportSpec,
};
pub use loader::{expand_variables, load_from_path, load_from_reader, load_from_str, ConfigError};
