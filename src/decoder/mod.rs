//! CAN signal decoding.
//!
//! [`DecoderRegistry`] maps an arbitration ID to a decode function producing zero or
//! more [`DecodedSignal`]s. Message types are added by registering another function;
//! nothing in the lookup path branches on specific IDs.
//!
//! Decoding never fails: unknown IDs and frames shorter than a decoder needs both
//! yield an empty vector.
//!
//! # Example
//! ```
//! use telemetry_gateway::decoder::DecoderRegistry;
//! use telemetry_gateway::types::CanFrame;
//!
//! let registry = DecoderRegistry::with_defaults();
//! let frame = CanFrame::new(0x03B, &[0x00, 0x64, 0x00, 0x32], false).unwrap();
//! let signals = registry.decode(&frame, 0);
//! assert_eq!(signals[0].name, "/BMS1/pack_current");
//! ```

pub mod tables;

use crate::types::{CanFrame, DecodedSignal};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A registered decode function.
pub type DecodeFn = Arc<dyn Fn(&CanFrame, u64) -> Vec<DecodedSignal> + Send + Sync>;

/// Arbitration ID to decoder lookup table.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<u32, DecodeFn>,
}

impl DecoderRegistry {
    /// Empty registry; every frame decodes to nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the vehicle's message table.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        tables::register_defaults(&mut registry);
        registry
    }

    /// Register `decode` for `arbitration_id`, returning the decoder it replaced.
    pub fn register<F>(&mut self, arbitration_id: u32, decode: F) -> Option<DecodeFn>
    where
        F: Fn(&CanFrame, u64) -> Vec<DecodedSignal> + Send + Sync + 'static,
    {
        self.decoders.insert(arbitration_id, Arc::new(decode))
    }

    /// Remove the decoder for `arbitration_id`. Returns whether one existed.
    pub fn unregister(&mut self, arbitration_id: u32) -> bool {
        self.decoders.remove(&arbitration_id).is_some()
    }

    /// Whether a decoder exists for `arbitration_id`.
    pub fn contains(&self, arbitration_id: u32) -> bool {
        self.decoders.contains_key(&arbitration_id)
    }

    /// Decode `frame`, stamping every signal with `timestamp_ns`.
    pub fn decode(&self, frame: &CanFrame, timestamp_ns: u64) -> Vec<DecodedSignal> {
        match self.decoders.get(&frame.arbitration_id()) {
            Some(decode) => decode(frame, timestamp_ns),
            None => Vec::new(),
        }
    }

    /// Number of registered IDs.
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// True when no decoder is registered.
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Registered IDs in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.decoders.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<String> = self.ids().iter().map(|id| format!("0x{id:03X}")).collect();
        f.debug_struct("DecoderRegistry").field("ids", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(id, data, false).unwrap()
    }

    #[test]
    fn decodes_pack_current_and_voltage() {
        let registry = DecoderRegistry::with_defaults();
        let signals = registry.decode(&frame(0x03B, &[0x00, 0x64, 0x00, 0x32]), 42);

        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].name, "/BMS1/pack_current");
        assert!((signals[0].value - 10.0).abs() < 1e-9);
        assert_eq!(signals[0].unit, "A");
        assert_eq!(signals[1].name, "/BMS1/pack_voltage");
        assert!((signals[1].value - 5.0).abs() < 1e-9);
        assert_eq!(signals[1].unit, "V");
        assert!(signals.iter().all(|s| s.timestamp_ns == 42));
    }

    #[test]
    fn unknown_id_yields_nothing() {
        let registry = DecoderRegistry::with_defaults();
        assert!(registry.decode(&frame(0x7FF, &[1, 2, 3, 4]), 0).is_empty());
        assert!(DecoderRegistry::new()
            .decode(&frame(0x03B, &[0, 0x64, 0, 0x32]), 0)
            .is_empty());
    }

    #[test]
    fn short_frames_yield_nothing_for_every_registered_id() {
        let registry = DecoderRegistry::with_defaults();
        for id in registry.ids() {
            let required = tables::required_len(id).unwrap();
            for len in 0..required {
                let data = vec![0xAB; len];
                assert!(
                    registry.decode(&frame(id, &data), 0).is_empty(),
                    "0x{id:03X} decoded a {len}-byte frame"
                );
            }
            assert!(!registry.decode(&frame(id, &vec![0xAB; required]), 0).is_empty());
        }
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let mut registry = DecoderRegistry::new();
        assert!(registry
            .register(0x100, |_, ts| vec![DecodedSignal::new("/a", 1.0, "", ts)])
            .is_none());
        assert!(registry
            .register(0x100, |_, ts| vec![DecodedSignal::new("/b", 2.0, "", ts)])
            .is_some());
        assert_eq!(registry.len(), 1);

        let signals = registry.decode(&frame(0x100, &[]), 7);
        assert_eq!(signals[0].name, "/b");

        assert!(registry.unregister(0x100));
        assert!(!registry.unregister(0x100));
        assert!(!registry.contains(0x100));
        assert!(registry.is_empty());
    }

    #[test]
    fn default_table_ids() {
        let registry = DecoderRegistry::with_defaults();
        assert_eq!(
            registry.ids(),
            vec![0x03B, 0x090, 0x091, 0x3CB, 0x584, 0x585, 0x586, 0x587, 0x6B2]
        );
    }
}
