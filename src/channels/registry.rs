// Copyright (c) 2026 ironloop contributors
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/ironloop/ironloop

//! Channel registry - the single owner of all channel state

use std::collections::HashMap;

use chrono::Utc;

use super::{Channel, ChannelAddress, ChannelKind};
use crate::config::ChannelDef;

/// Typed table of every configured channel, in configuration order.
///
/// Iteration order is deterministic so that sampling, dispatch and
/// persistence always walk channels the same way.
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    order: Vec<String>,
}

impl ChannelRegistry {
    /// Build the registry from validated configuration.
    pub fn from_defs(defs: &[ChannelDef]) -> Self {
        let mut channels = HashMap::with_capacity(defs.len());
        let mut order = Vec::with_capacity(defs.len());
        for def in defs {
            order.push(def.name.clone());
            channels.insert(def.name.clone(), Channel::from_def(def));
        }
        Self { channels, order }
    }

    /// Look up a channel by name.
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    /// Look up a channel mutably by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.get_mut(name)
    }

    /// All channels in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.order.iter().filter_map(|n| self.channels.get(n))
    }

    /// Number of configured channels.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no channels are configured.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Name and address of every input channel, for the sampler.
    pub fn input_targets(&self) -> Vec<(String, ChannelAddress)> {
        self.iter()
            .filter(|c| c.kind.is_input())
            .map(|c| (c.name.clone(), c.address.clone()))
            .collect()
    }

    /// Walk the digital inputs mutably in configuration order.
    pub fn for_each_digital_input(&mut self, mut f: impl FnMut(&mut Channel)) {
        for name in &self.order {
            if let Some(ch) = self.channels.get_mut(name) {
                if ch.kind == ChannelKind::DigitalIn {
                    f(ch);
                }
            }
        }
    }

    /// Apply a commanded value to an output channel.
    ///
    /// Returns false if the channel does not exist or is not an output.
    pub fn apply_output(&mut self, name: &str, value: f64) -> bool {
        match self.channels.get_mut(name) {
            Some(ch) if ch.kind.is_output() => {
                ch.command(value, Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Drain the set of outputs waiting for a hardware write.
    pub fn take_pending(&mut self) -> Vec<(String, ChannelAddress, f64)> {
        let mut out = Vec::new();
        for name in &self.order {
            if let Some(ch) = self.channels.get_mut(name) {
                if ch.pending {
                    ch.pending = false;
                    out.push((ch.name.clone(), ch.address.clone(), ch.value));
                }
            }
        }
        out
    }

    /// True when at least one output is waiting for a hardware write.
    pub fn has_pending(&self) -> bool {
        self.channels.values().any(|c| c.pending)
    }

    /// Output channels with their safe values, for the shutdown path.
    pub fn safe_targets(&self) -> Vec<(String, ChannelAddress, f64)> {
        self.iter()
            .filter(|c| c.kind.is_output())
            .map(|c| (c.name.clone(), c.address.clone(), c.safe_value))
            .collect()
    }

    /// Mark every output as holding its safe value (after a safe-state write).
    pub fn mark_safe(&mut self) {
        let now = Utc::now();
        for ch in self.channels.values_mut() {
            if ch.kind.is_output() {
                ch.value = ch.safe_value;
                ch.updated_at = now;
                ch.pending = false;
            }
        }
    }
}
