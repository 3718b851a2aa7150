//! Reactor contract and channel routing.
//!
//! A reactor is a subsystem that claims one or more channel ids and
//! handles their inbound frames. Reactors are registered before the
//! switch starts; once the switch is running the registry is immutable.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::connection::ChannelDescriptor;
use crate::error::P2pResult;
use crate::peer::Peer;
use crate::switch::Switch;

/// A subsystem attached to the switch.
///
/// `receive` runs on the owning peer's receive dispatcher, which is
/// serialized per connection; implementations must not block
/// indefinitely there.
pub trait Reactor: Send + Sync {
    /// Channels this reactor claims. Each id may be claimed by exactly
    /// one reactor per switch.
    fn channels(&self) -> Vec<ChannelDescriptor>;

    /// Called when the switch starts.
    fn on_start(&self) -> P2pResult<()> {
        Ok(())
    }

    /// Called when the switch stops.
    fn on_stop(&self) {}

    /// Non-owning back-reference to the switch, handed out at
    /// registration. Reactor lifetime is bounded by switch lifetime.
    fn attach_switch(&self, _switch: Weak<Switch>) {}

    /// A new peer completed the handshake. Returning an error stops and
    /// removes the peer.
    fn add_peer(&self, peer: &Arc<Peer>) -> P2pResult<()>;

    /// A peer was stopped and removed.
    fn remove_peer(&self, peer: &Arc<Peer>, reason: &str);

    /// An inbound frame arrived on one of this reactor's channels.
    fn receive(&self, channel_id: u8, peer: &Arc<Peer>, payload: &[u8]);
}

struct Inner {
    /// Reactors in registration order; callbacks fire in this order.
    reactors: Vec<(String, Arc<dyn Reactor>)>,
    /// Channel id to index into `reactors`.
    by_channel: HashMap<u8, usize>,
    /// All channel descriptors across reactors.
    descriptors: Vec<ChannelDescriptor>,
}

/// Routes channel ids to the reactors that claimed them.
pub struct ReactorRegistry {
    inner: RwLock<Inner>,
}

impl ReactorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                reactors: Vec::new(),
                by_channel: HashMap::new(),
                descriptors: Vec::new(),
            }),
        }
    }

    /// Register a reactor under a name.
    ///
    /// Panics if any of its channel ids is already claimed; two reactors
    /// sharing a channel is a fatal configuration error.
    pub fn add(&self, name: &str, reactor: Arc<dyn Reactor>) {
        let mut inner = self.inner.write().expect("lock poisoned");
        let index = inner.reactors.len();

        for desc in reactor.channels() {
            if let Some(existing) = inner.by_channel.get(&desc.id) {
                panic!(
                    "channel {:#04x} has multiple reactors: {} and {}",
                    desc.id, inner.reactors[*existing].0, name
                );
            }
            inner.by_channel.insert(desc.id, index);
            inner.descriptors.push(desc);
        }

        inner.reactors.push((name.to_string(), reactor));
    }

    /// The reactor that claimed a channel id.
    pub fn route(&self, channel_id: u8) -> Option<Arc<dyn Reactor>> {
        let inner = self.inner.read().expect("lock poisoned");
        inner
            .by_channel
            .get(&channel_id)
            .map(|index| inner.reactors[*index].1.clone())
    }

    /// Look up a reactor by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Reactor>> {
        let inner = self.inner.read().expect("lock poisoned");
        inner
            .reactors
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, reactor)| reactor.clone())
    }

    /// All channel descriptors, in registration order.
    pub fn descriptors(&self) -> Vec<ChannelDescriptor> {
        self.inner.read().expect("lock poisoned").descriptors.clone()
    }

    /// All reactors, in registration order.
    pub fn in_order(&self) -> Vec<Arc<dyn Reactor>> {
        self.inner
            .read()
            .expect("lock poisoned")
            .reactors
            .iter()
            .map(|(_, reactor)| reactor.clone())
            .collect()
    }

    /// Start every reactor in registration order.
    pub fn start_all(&self) -> P2pResult<()> {
        for reactor in self.in_order() {
            reactor.on_start()?;
        }
        Ok(())
    }

    /// Stop every reactor.
    pub fn stop_all(&self) {
        for reactor in self.in_order() {
            reactor.on_stop();
        }
    }
}

impl Default for ReactorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubReactor {
        channels: Vec<ChannelDescriptor>,
    }

    impl StubReactor {
        fn new(ids: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                channels: ids.iter().map(|id| ChannelDescriptor::new(*id, 1)).collect(),
            })
        }
    }

    impl Reactor for StubReactor {
        fn channels(&self) -> Vec<ChannelDescriptor> {
            self.channels.clone()
        }

        fn add_peer(&self, _peer: &Arc<Peer>) -> P2pResult<()> {
            Ok(())
        }

        fn remove_peer(&self, _peer: &Arc<Peer>, _reason: &str) {}

        fn receive(&self, _channel_id: u8, _peer: &Arc<Peer>, _payload: &[u8]) {}
    }

    #[test]
    fn test_routing() {
        let registry = ReactorRegistry::new();
        let foo = StubReactor::new(&[0x00, 0x01]);
        let bar = StubReactor::new(&[0x02, 0x03]);

        registry.add("foo", foo.clone());
        registry.add("bar", bar.clone());

        let foo_dyn: Arc<dyn Reactor> = foo;
        let bar_dyn: Arc<dyn Reactor> = bar;
        assert!(Arc::ptr_eq(&registry.route(0x01).unwrap(), &foo_dyn));
        assert!(Arc::ptr_eq(&registry.route(0x02).unwrap(), &bar_dyn));
        assert!(registry.route(0x07).is_none());
        assert_eq!(registry.descriptors().len(), 4);
    }

    #[test]
    #[should_panic(expected = "multiple reactors")]
    fn test_duplicate_channel_panics() {
        let registry = ReactorRegistry::new();
        registry.add("foo", StubReactor::new(&[0x01]));
        registry.add("bar", StubReactor::new(&[0x01]));
    }

    #[test]
    fn test_registration_order() {
        let registry = ReactorRegistry::new();
        registry.add("foo", StubReactor::new(&[0x00]));
        registry.add("bar", StubReactor::new(&[0x01]));

        assert!(registry.get("foo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.in_order().len(), 2);
    }
}
