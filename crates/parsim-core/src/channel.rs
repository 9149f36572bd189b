//! Channels: the typed, delay-annotated pipes between entities.
//!
//! Input channels are named (or anonymous, for entity-internal wiring) and
//! register in a name table that is gossiped across machines at `start()`.
//! Output channels carry a non-negative default delay and a list of mapping
//! requests — name patterns plus extra delay — resolved lazily at `start()`
//! into concrete destinations. The minimum resolved delay between any two
//! timelines is that pair's lookahead.

use std::sync::Arc;

use crate::event::Event;
use crate::time::VirtualTime;

/// Handle to an input channel, valid for the kernel that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InChannel(pub(crate) u32);

/// Handle to an output channel, valid for the kernel that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutChannel(pub(crate) u32);

impl InChannel {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl OutChannel {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A mapping request recorded by `map_to` before resolution.
#[derive(Debug, Clone)]
pub(crate) enum MapRequest {
    /// Match input channel names against a pattern.
    Pattern { pattern: String, extra: VirtualTime },
    /// Direct object mapping to a local input channel (may be anonymous).
    Direct { target: InChannel, extra: VirtualTime },
}

/// A concrete destination of an output channel after resolution.
#[derive(Debug, Clone)]
pub(crate) enum Dest {
    /// Input channel on the same timeline: writes enqueue directly.
    LocalSame { ic_slot: usize, delay: VirtualTime },
    /// Input channel on another timeline of this machine: writes buffer in
    /// the per-peer outbox.
    LocalOther {
        timeline: usize,
        ic_slot: usize,
        delay: VirtualTime,
    },
    /// Input channel on another machine: writes pack into wire frames.
    Remote {
        machine: usize,
        name: Arc<str>,
        delay: VirtualTime,
    },
}

impl Dest {
    pub(crate) fn delay(&self) -> VirtualTime {
        match self {
            Dest::LocalSame { delay, .. }
            | Dest::LocalOther { delay, .. }
            | Dest::Remote { delay, .. } => *delay,
        }
    }
}

/// Builder-side record of an input channel.
pub(crate) struct InChannelSpec {
    pub owner: usize,
    pub name: Option<String>,
}

/// Builder-side record of an output channel.
pub(crate) struct OutChannelSpec {
    pub owner: usize,
    pub delay: VirtualTime,
    pub mappings: Vec<MapRequest>,
}

/// Timeline-local slot of an input channel.
pub(crate) struct InChannelSlot {
    /// The builder handle, reported back through `SimCtx::active_channel`.
    pub handle: InChannel,
    pub name: Option<Arc<str>>,
    /// Processes currently parked on this channel (timeline-local ids).
    pub waiters: Vec<usize>,
    /// The active event while its receivers run, per the channel contract.
    pub active: Option<Box<dyn Event>>,
}

/// Timeline-local slot of an output channel with resolved destinations.
pub(crate) struct OutChannelSlot {
    pub dests: Vec<Dest>,
}

/// Match an input channel name against a mapping pattern.
///
/// Patterns are exact names, or contain a single `*` matching any (possibly
/// empty) run of characters.
pub(crate) fn pattern_matches(pattern: &str, name: &str) -> bool {
    match pattern.find('*') {
        None => pattern == name,
        Some(pos) => {
            let (prefix, suffix) = (&pattern[..pos], &pattern[pos + 1..]);
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(pattern_matches("IN_3", "IN_3"));
        assert!(!pattern_matches("IN_3", "IN_30"));
        assert!(!pattern_matches("IN_3", "IN_2"));
    }

    #[test]
    fn test_wildcard_suffix() {
        assert!(pattern_matches("IN_*", "IN_0"));
        assert!(pattern_matches("IN_*", "IN_"));
        assert!(!pattern_matches("IN_*", "OUT_0"));
    }

    #[test]
    fn test_wildcard_prefix() {
        assert!(pattern_matches("*_0", "IN_0"));
        assert!(!pattern_matches("*_0", "IN_1"));
    }

    #[test]
    fn test_wildcard_middle() {
        assert!(pattern_matches("IN_*_0", "IN_7_0"));
        assert!(pattern_matches("IN_*_0", "IN__0"));
        assert!(!pattern_matches("IN_*_0", "IN_7_1"));
    }

    #[test]
    fn test_wildcard_does_not_overlap() {
        // Prefix and suffix must not claim the same characters.
        assert!(!pattern_matches("ab*ba", "aba"));
        assert!(pattern_matches("ab*ba", "abba"));
    }
}
