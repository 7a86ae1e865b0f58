//! Protocol registry and auto-detection.

use crate::codec::{FrameCodec, PrefixMatch, PrefixOnlyCodec};
use crate::gt06::Gt06Codec;
use parking_lot::RwLock;
use std::sync::Arc;

/// Outcome of protocol detection on a connection's leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// A registered protocol matched.
    Match(String),
    /// Not enough bytes yet to decide.
    NeedMore,
    /// Enough bytes arrived and nothing matches.
    NoMatch,
}

/// Named protocol codecs, consulted in registration order.
#[derive(Default)]
pub struct ProtocolRegistry {
    codecs: RwLock<Vec<Arc<dyn FrameCodec>>>,
}

impl ProtocolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the GT06 codec and the detection-only families.
    pub fn with_defaults(gt06: Gt06Codec) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(gt06));
        registry.register(Arc::new(PrefixOnlyCodec::h02()));
        registry.register(Arc::new(PrefixOnlyCodec::tk103()));
        registry.register(Arc::new(PrefixOnlyCodec::meitrack()));
        registry
    }

    /// Registers a codec under its own name, replacing any codec with that name.
    pub fn register(&self, codec: Arc<dyn FrameCodec>) {
        let mut codecs = self.codecs.write();
        match codecs.iter().position(|c| c.name() == codec.name()) {
            Some(idx) => codecs[idx] = codec,
            None => codecs.push(codec),
        }
    }

    /// Looks up a codec by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn FrameCodec>> {
        self.codecs.read().iter().find(|c| c.name() == name).cloned()
    }

    /// Returns registered protocol names in detection order.
    pub fn names(&self) -> Vec<String> {
        self.codecs
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Returns the number of registered codecs.
    pub fn len(&self) -> usize {
        self.codecs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.read().is_empty()
    }

    /// Identifies the protocol from the bytes received so far.
    ///
    /// A prefix shorter than the shortest registered marker is always
    /// `NeedMore`, as is a prefix that could still grow into a longer marker.
    pub fn identify(&self, prefix: &[u8]) -> Detection {
        let codecs = self.codecs.read();
        let Some(shortest) = codecs.iter().map(|c| c.marker().len()).min() else {
            return Detection::NoMatch;
        };
        if prefix.len() < shortest {
            return Detection::NeedMore;
        }

        let mut partial = false;
        for codec in codecs.iter() {
            match codec.detect(prefix) {
                PrefixMatch::Match => return Detection::Match(codec.name().to_string()),
                PrefixMatch::Partial => partial = true,
                PrefixMatch::Mismatch => {}
            }
        }

        if partial {
            Detection::NeedMore
        } else {
            Detection::NoMatch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AckKind, Decoded};
    use crate::error::ProtocolError;
    use bytes::BytesMut;

    fn registry() -> ProtocolRegistry {
        ProtocolRegistry::with_defaults(Gt06Codec::new())
    }

    #[test]
    fn test_identify_gt06() {
        let registry = registry();
        assert_eq!(
            registry.identify(&[0x78, 0x78, 0x0D, 0x01]),
            Detection::Match("gt06".into())
        );
        assert_eq!(
            registry.identify(&[0x78, 0x78]),
            Detection::Match("gt06".into())
        );
    }

    #[test]
    fn test_identify_ascii_families() {
        let registry = registry();
        assert_eq!(
            registry.identify(b"*HQ,865205030000000,V1#"),
            Detection::Match("h02".into())
        );
        assert_eq!(
            registry.identify(b"##,imei:359586015829802,A;"),
            Detection::Match("tk103".into())
        );
        assert_eq!(
            registry.identify(b"$$A138,862170010187175"),
            Detection::Match("meitrack".into())
        );
    }

    #[test]
    fn test_short_prefix_is_undecided() {
        let registry = registry();
        assert_eq!(registry.identify(&[]), Detection::NeedMore);
        assert_eq!(registry.identify(&[0x78]), Detection::NeedMore);
        // Shorter than every marker, even though no marker starts with it.
        assert_eq!(registry.identify(b"G"), Detection::NeedMore);
    }

    #[test]
    fn test_partial_longer_marker_is_undecided() {
        let registry = registry();
        assert_eq!(registry.identify(b"*H"), Detection::NeedMore);
        assert_eq!(registry.identify(b"*HQ"), Detection::NeedMore);
        assert_eq!(registry.identify(b"##"), Detection::NeedMore);
    }

    #[test]
    fn test_no_match() {
        let registry = registry();
        assert_eq!(registry.identify(b"GET / HTTP/1.1"), Detection::NoMatch);
        assert_eq!(registry.identify(&[0x78, 0x79]), Detection::NoMatch);
        assert_eq!(registry.identify(b"*X"), Detection::NoMatch);
    }

    #[test]
    fn test_empty_registry_never_matches() {
        let registry = ProtocolRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.identify(&[0x78, 0x78]), Detection::NoMatch);
    }

    #[test]
    fn test_get_and_names() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["gt06", "h02", "tk103", "meitrack"]);
        assert_eq!(registry.len(), 4);
        assert!(registry.get("gt06").is_some());
        assert!(registry.get("nope").is_none());
    }

    struct FakeCodec;

    impl FrameCodec for FakeCodec {
        fn name(&self) -> &str {
            "h02"
        }

        fn marker(&self) -> &[u8] {
            b"*HQ,"
        }

        fn decode(&self, _buf: &[u8]) -> Result<Option<Decoded>, ProtocolError> {
            Ok(None)
        }

        fn encode_ack(&self, _kind: AckKind, _serial: u16) -> Option<BytesMut> {
            Some(BytesMut::from(&b"ok"[..]))
        }
    }

    #[test]
    fn test_register_replaces_by_name() {
        let registry = registry();
        registry.register(Arc::new(FakeCodec));
        assert_eq!(registry.len(), 4);

        let codec = registry.get("h02").unwrap();
        assert!(codec.decode(b"*HQ,1").unwrap().is_none());
        assert!(codec.encode_ack(AckKind::Heartbeat, 0).is_some());
    }
}
