//! Configuration loading, validation, env substitution.
//!
//! Config files: `pairgate.toml`, `pairgate.yaml`, or `pairgate.json`.
//! Searched in `./` then `~/.config/pairgate/`.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, find_or_default_config_path,
        load_config, set_config_dir,
    },
    schema::{BridgeConfig, GatewayConfig, PairgateConfig, RestartConfig, WhatsAppConfig},
};
