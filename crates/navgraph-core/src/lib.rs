pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod tree;
pub mod types;

pub use config::AppConfig;
pub use error::{NavError, Result};
pub use event::EventBus;
pub use traits::{DeviceController, VerificationProvider};
pub use tree::*;
pub use types::*;
