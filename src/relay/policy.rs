//! Forwarding policy evaluation
//!
//! Pure, deterministic transform from inbound delivery attributes to the
//! attributes used for the destination publish.

use crate::config::ForwardConfig;

/// Immutable per-message policy, computed once at startup before the source
/// subscription is issued so no message is ever handled without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardPolicy {
    /// Outbound QoS ceiling (0..=2, validated at config load)
    pub qos_max: u8,
    /// Whether the inbound retained flag is forwarded or suppressed
    pub forward_retain: bool,
}

impl ForwardPolicy {
    pub fn new(config: &ForwardConfig) -> Self {
        Self {
            qos_max: config.qos_max,
            forward_retain: config.forward_retain,
        }
    }

    /// Compute outbound (qos, retain) for one message.
    ///
    /// Outbound QoS is the inbound QoS clamped to the ceiling; outbound
    /// retain is the inbound flag unless retain forwarding is off.
    pub fn evaluate(&self, qos: u8, retain: bool) -> (u8, bool) {
        (qos.min(self.qos_max), self.forward_retain && retain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn policy(qos_max: u8, forward_retain: bool) -> ForwardPolicy {
        ForwardPolicy {
            qos_max,
            forward_retain,
        }
    }

    #[test_case(0, 0 => 0)]
    #[test_case(0, 1 => 0)]
    #[test_case(0, 2 => 0)]
    #[test_case(1, 0 => 0)]
    #[test_case(1, 1 => 1)]
    #[test_case(1, 2 => 1)]
    #[test_case(2, 0 => 0)]
    #[test_case(2, 1 => 1)]
    #[test_case(2, 2 => 2)]
    fn test_qos_clamp(incoming: u8, ceiling: u8) -> u8 {
        let (out_qos, _) = policy(ceiling, true).evaluate(incoming, false);
        out_qos
    }

    #[test]
    fn test_qos_zero_never_upgraded() {
        let (out_qos, _) = policy(2, true).evaluate(0, false);
        assert_eq!(out_qos, 0);
    }

    #[test]
    fn test_retain_suppressed_when_forwarding_disabled() {
        let p = policy(2, false);
        assert_eq!(p.evaluate(1, true), (1, false));
        assert_eq!(p.evaluate(1, false), (1, false));
    }

    #[test]
    fn test_retain_preserved_when_forwarding_enabled() {
        let p = policy(2, true);
        assert_eq!(p.evaluate(1, true), (1, true));
        assert_eq!(p.evaluate(1, false), (1, false));
    }

    #[test]
    fn test_from_config() {
        let config = ForwardConfig {
            qos_max: 0,
            forward_retain: false,
            ..Default::default()
        };
        let p = ForwardPolicy::new(&config);
        assert_eq!(p.qos_max, 0);
        assert!(!p.forward_retain);
    }
}
