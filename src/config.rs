pub(crate) mod config_holder;
pub(crate) mod env_var;
pub(crate) mod store;
pub(crate) mod toml;
