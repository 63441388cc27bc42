pub mod catalog;
pub mod cipher;
pub mod config;
pub mod constants;
pub mod decoded;
pub mod device;
pub mod error;
pub mod image;
pub mod keygen;
pub mod keys;
pub mod patch;
pub mod protocol;
pub mod registry;
pub mod signature;
pub mod transport;

pub use config::SessionConfig;
pub use device::{DeviceSession, SessionState};
pub use error::{Error, ErrorKind, Result};
pub use image::{FigureId, TagImage, Uid};
pub use keys::KeySet;
pub use patch::PatchEngine;
