pub mod logging;
pub mod provision;
pub mod settings;
pub mod system;
