//! Hook dispatcher and the compile-time plugin registry.
//!
//! Plugins are built-in modules implementing [`Plugin`]; they hook named
//! bootstrap/teardown points and may own a file descriptor serviced by the
//! event loop. Callbacks run in topological order of their declared
//! dependencies and mutate the registry and condition store through the same
//! handles configuration uses.

use std::{collections::HashMap, os::fd::RawFd};

use tracing::warn;

use crate::{cond::CondStore, conf::Conf, svc::Registry};

/// Named hook points, in bootstrap order; teardown duals run in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::AsRefStr)]
pub enum Hook {
    /// Boot banner, before anything else.
    Banner,
    /// Root filesystem mounted read-write.
    RootfsUp,
    /// Base filesystems (/proc, /sys, /dev, /run) available.
    BasefsUp,
    /// Network bring-up helper finished.
    NetworkUp,
    /// Services have been stepped for the first time.
    SvcUp,
    /// System fully up in its configured runlevel.
    SystemUp,
    /// Configuration reload converged; reassert external state.
    SvcReconf,
    /// Services are being taken down for shutdown.
    SvcDown,
    /// Network teardown.
    NetworkDown,
    /// Base filesystems about to go away.
    BasefsDown,
    /// Last call before halt/reboot.
    RootfsDown,
}

/// Mutable supervisor state handed to plugin callbacks.
pub struct PluginCtx<'a> {
    pub registry: &'a mut Registry,
    pub conds: &'a mut CondStore,
    pub conf: &'a Conf,
}

/// A built-in extension: one callback per hook plus an optional descriptor.
pub trait Plugin {
    fn name(&self) -> &'static str;

    /// Plugins named here run their hooks before this one.
    fn depends(&self) -> &'static [&'static str] {
        &[]
    }

    /// Invoked for every hook point; match on the ones of interest.
    fn hook(&mut self, hook: Hook, ctx: &mut PluginCtx);

    /// Descriptor to watch for readability, if any.
    fn io_fd(&self) -> Option<RawFd> {
        None
    }

    /// Called when [`Plugin::io_fd`] becomes readable.
    fn io_ready(&mut self, _ctx: &mut PluginCtx) {}
}

/// Owns the plugins and invokes their callbacks in dependency order.
#[derive(Default)]
pub struct Dispatcher {
    plugins: Vec<Box<dyn Plugin>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The compile-time registry of built-in plugins.
    pub fn with_builtins() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Box::new(crate::plugins::BannerPlugin::default()));
        dispatcher.register(Box::new(crate::plugins::PidfilePlugin::default()));
        dispatcher.sort();
        dispatcher
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Orders plugins topologically by `depends`. A dependency cycle is
    /// logged and registration order kept.
    pub fn sort(&mut self) {
        let index_by_name: HashMap<&'static str, usize> = self
            .plugins
            .iter()
            .enumerate()
            .map(|(index, plugin)| (plugin.name(), index))
            .collect();

        let mut indegree = vec![0usize; self.plugins.len()];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.plugins.len()];
        for (index, plugin) in self.plugins.iter().enumerate() {
            for dep in plugin.depends() {
                match index_by_name.get(dep) {
                    Some(&dep_index) => {
                        edges[dep_index].push(index);
                        indegree[index] += 1;
                    }
                    None => warn!(
                        "plugin {} depends on unknown plugin {dep}",
                        plugin.name()
                    ),
                }
            }
        }

        let mut queue: Vec<usize> = (0..self.plugins.len())
            .filter(|&index| indegree[index] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.plugins.len());
        while let Some(index) = queue.pop() {
            order.push(index);
            for &next in &edges[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if order.len() != self.plugins.len() {
            warn!("plugin dependency cycle, keeping registration order");
            return;
        }

        let mut sorted: Vec<Option<Box<dyn Plugin>>> =
            self.plugins.drain(..).map(Some).collect();
        self.plugins = order
            .into_iter()
            .filter_map(|index| sorted[index].take())
            .collect();
    }

    /// Runs every plugin's callback for `hook`.
    pub fn run_hook(&mut self, hook: Hook, ctx: &mut PluginCtx) {
        for plugin in &mut self.plugins {
            plugin.hook(hook, ctx);
        }
    }

    /// Descriptors the event loop should watch, keyed by plugin index.
    pub fn io_sources(&self) -> Vec<(usize, RawFd)> {
        self.plugins
            .iter()
            .enumerate()
            .filter_map(|(index, plugin)| plugin.io_fd().map(|fd| (index, fd)))
            .collect()
    }

    /// Dispatches a readable event to the plugin at `index`.
    pub fn io_ready(&mut self, index: usize, ctx: &mut PluginCtx) {
        if let Some(plugin) = self.plugins.get_mut(index) {
            plugin.io_ready(ctx);
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
