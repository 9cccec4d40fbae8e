mod error;

#[cfg(feature = "gateway")]
pub mod gateway;
pub mod utils;

pub use error::{Error, Result};

#[cfg(feature = "gateway")]
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayResponse};
