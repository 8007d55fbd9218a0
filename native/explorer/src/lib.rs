//! Remote filesystem access to Android devices over the Android Debug Bridge.
//!
//! [`Session`] is the entry point: it owns the transport, the known devices, the
//! browsing position on the active device and the background tasks.

pub mod adb;
pub mod error;
pub mod listing;
pub mod logging;
pub mod models;
pub mod navigation;
pub mod registry;
pub mod repository;
pub mod session;
pub mod settings;
pub mod task;
pub mod utils;

pub use error::{ErrorKind, ExplorerError};
pub use models::Settings;
pub use session::{Notification, Session, SessionEvent};
pub use settings::SettingsHandler;
pub use task::{TaskId, TaskOutput};
