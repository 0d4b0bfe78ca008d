pub mod schema;

#[allow(unused_imports)]
pub use schema::{
    BackendConfig, ChannelsConfig, Config, PipelineConfig, SessionConfig, TelegramConfig,
    CONFIG_DIR_ENV,
};
