pub(crate) mod apk_info;
mod app_status;
pub use app_status::*;
mod device_identity;
pub use device_identity::*;
mod settings;
pub use settings::*;
pub mod signals;
