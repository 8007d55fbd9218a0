mod device;
mod file_entry;
mod progress;
mod settings;

pub use device::*;
pub use file_entry::*;
pub use progress::*;
pub use settings::*;
