//! Built-in plugins.

mod banner;
mod pidfile;

pub use banner::BannerPlugin;
pub use pidfile::PidfilePlugin;
