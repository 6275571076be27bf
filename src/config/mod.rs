pub mod gateway;
pub mod settings;

pub use gateway::{
    ApiType, GatewayConfig, Pricing, ProtocolConfig, ProtocolsConfig, Provider, mask_key,
    normalize_model_name,
};
pub use settings::Settings;
