pub mod config;
pub mod error;

pub use config::MountConfig;
pub use error::{XfsError, XfsResult};
