//! Configuration merge system
//!
//! Four layers, later ones winning:
//! 1. Built-in defaults
//! 2. Host config (~/.config/tex-lane/config.toml)
//! 3. Submission config (--config, or tex-lane.toml beside the submission)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::{
    FixupSettings, IsolationMode, LaneConfig, OutcomeSettings, ResolverSettings, SandboxSettings,
    DEFAULT_RESOLVER_HELPER, MAX_PASSES_LIMIT,
};
pub use effective::{
    default_host_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig,
    HOST_CONFIG_PATH,
};
pub use merge::{deep_merge, merge_into, merge_layers};
