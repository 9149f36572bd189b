//! Polymorphic events and the type registry.
//!
//! Every event type carries a small `u32` tag. The registry stores, per tag,
//! the factory that rebuilds an event from its packed wire payload; cloning
//! and packing live on the event itself. User code downcasts a received
//! event through [`Event::as_any`].

use std::any::Any;
use std::collections::HashMap;

use crate::error::{SetupError, TransportError};

/// Registered tag of an event type. Tag 0 is reserved for [`BareEvent`].
pub type EventTypeId = u32;

/// A simulation event.
///
/// Implementations must be deep-cloneable (an event written to a channel is
/// cloned once per destination) and, if they ever cross machines, must pack
/// to and unpack from a byte payload losslessly.
pub trait Event: Send {
    /// The registered type tag.
    fn event_type(&self) -> EventTypeId;

    /// Deep copy.
    fn clone_event(&self) -> Box<dyn Event>;

    /// Append the wire payload to `buf`. The default packs nothing, which is
    /// correct for payload-free signal events.
    fn pack(&self, buf: &mut Vec<u8>) {
        let _ = buf;
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

/// Factory rebuilding an event from its packed payload.
pub type UnpackFn = fn(&[u8]) -> Result<Box<dyn Event>, TransportError>;

/// An event with no payload, useful as a pure signal. The instantiable base
/// event: registered under type id 0 by every kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BareEvent;

impl BareEvent {
    /// The reserved type id.
    pub const TYPE_ID: EventTypeId = 0;

    fn unpack(payload: &[u8]) -> Result<Box<dyn Event>, TransportError> {
        if payload.is_empty() {
            Ok(Box::new(BareEvent))
        } else {
            Err(TransportError::Codec {
                detail: format!("bare event with {} payload bytes", payload.len()),
            })
        }
    }
}

impl Event for BareEvent {
    fn event_type(&self) -> EventTypeId {
        Self::TYPE_ID
    }

    fn clone_event(&self) -> Box<dyn Event> {
        Box::new(BareEvent)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-id keyed table of event factories.
pub struct EventRegistry {
    factories: HashMap<EventTypeId, UnpackFn>,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    /// A registry with the bare event pre-registered.
    pub fn new() -> Self {
        let mut factories: HashMap<EventTypeId, UnpackFn> = HashMap::new();
        factories.insert(BareEvent::TYPE_ID, BareEvent::unpack);
        EventRegistry { factories }
    }

    /// Register an event type. Each tag may be registered once.
    pub fn register(&mut self, type_id: EventTypeId, unpack: UnpackFn) -> Result<(), SetupError> {
        if self.factories.contains_key(&type_id) {
            return Err(SetupError::DuplicateEventType { type_id });
        }
        self.factories.insert(type_id, unpack);
        Ok(())
    }

    /// Rebuild an event from its tag and packed payload.
    pub fn unpack(
        &self,
        type_id: EventTypeId,
        payload: &[u8],
    ) -> Result<Box<dyn Event>, TransportError> {
        match self.factories.get(&type_id) {
            Some(factory) => factory(payload),
            None => Err(TransportError::UnknownEventType { type_id }),
        }
    }

    /// Whether a tag is known.
    pub fn knows(&self, type_id: EventTypeId) -> bool {
        self.factories.contains_key(&type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // A payload-carrying event for registry round trips
    // -----------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct Stamped {
        origin: u32,
        born: i64,
    }

    impl Stamped {
        const TYPE_ID: EventTypeId = 7;

        fn unpack(payload: &[u8]) -> Result<Box<dyn Event>, TransportError> {
            if payload.len() != 12 {
                return Err(TransportError::Codec {
                    detail: "stamped event payload must be 12 bytes".into(),
                });
            }
            let origin = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            let born = i64::from_le_bytes(payload[4..12].try_into().unwrap());
            Ok(Box::new(Stamped { origin, born }))
        }
    }

    impl Event for Stamped {
        fn event_type(&self) -> EventTypeId {
            Self::TYPE_ID
        }
        fn clone_event(&self) -> Box<dyn Event> {
            Box::new(self.clone())
        }
        fn pack(&self, buf: &mut Vec<u8>) {
            buf.extend_from_slice(&self.origin.to_le_bytes());
            buf.extend_from_slice(&self.born.to_le_bytes());
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_bare_event_pre_registered() {
        let reg = EventRegistry::new();
        assert!(reg.knows(BareEvent::TYPE_ID));
        let ev = reg.unpack(BareEvent::TYPE_ID, &[]).unwrap();
        assert_eq!(ev.event_type(), BareEvent::TYPE_ID);
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut reg = EventRegistry::new();
        reg.register(Stamped::TYPE_ID, Stamped::unpack).unwrap();
        assert!(reg.register(Stamped::TYPE_ID, Stamped::unpack).is_err());
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let mut reg = EventRegistry::new();
        reg.register(Stamped::TYPE_ID, Stamped::unpack).unwrap();

        let original = Stamped { origin: 3, born: -44 };
        let mut buf = Vec::new();
        original.pack(&mut buf);

        let rebuilt = reg.unpack(Stamped::TYPE_ID, &buf).unwrap();
        let rebuilt = rebuilt.as_any().downcast_ref::<Stamped>().unwrap();
        assert_eq!(rebuilt, &original);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let reg = EventRegistry::new();
        assert!(matches!(
            reg.unpack(99, &[]),
            Err(TransportError::UnknownEventType { type_id: 99 })
        ));
    }

    #[test]
    fn test_clone_is_deep() {
        let original = Stamped { origin: 1, born: 2 };
        let copy = original.clone_event();
        let copy = copy.as_any().downcast_ref::<Stamped>().unwrap();
        assert_eq!(copy, &original);
    }

    #[test]
    fn test_bare_rejects_payload() {
        let reg = EventRegistry::new();
        assert!(reg.unpack(BareEvent::TYPE_ID, &[1]).is_err());
    }
}
