//! Boot banner plugin.

use tracing::info;

use crate::plugin::{Hook, Plugin, PluginCtx};

/// Prints the boot banner at the `Banner` hook.
#[derive(Default)]
pub struct BannerPlugin;

impl Plugin for BannerPlugin {
    fn name(&self) -> &'static str {
        "banner"
    }

    fn hook(&mut self, hook: Hook, ctx: &mut PluginCtx) {
        if hook != Hook::Banner {
            return;
        }
        let hostname = ctx
            .conf
            .hostname
            .as_deref()
            .unwrap_or(crate::constants::DEFAULT_HOSTNAME);
        info!(
            "rinit {} booting {hostname}",
            env!("CARGO_PKG_VERSION")
        );
    }
}
