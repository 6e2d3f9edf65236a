pub mod chain;
pub mod config;
pub mod constants;
pub mod errors;
pub mod explorer;
pub mod keeper;
pub mod logging;
pub mod provisioning;
pub mod proxy;
pub mod registration;
pub mod registry;
pub mod shutdown;

#[macro_export]
macro_rules! strip_0x_prefix {
    ($hex:expr) => {
        $hex.strip_prefix("0x").unwrap_or(&$hex).into()
    };
}
