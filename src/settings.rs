use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::anyhow;

/// Connection tuning knobs.  The defaults follow RFC 7252; keepalive is off
/// until a ping interval is set.
#[derive(Debug, Clone)]
pub struct Settings {
    pub(crate) ping_interval: Duration,
    pub(crate) keepalive_factor: u32,
    pub(crate) transmission: TransmissionParameters,
    pub(crate) security: Option<DtlsParameters>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::ZERO,
            keepalive_factor: 3,
            transmission: TransmissionParameters::default(),
            security: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send an Empty CON ping whenever the interval elapses; a zero duration
    /// disables keepalive entirely.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// The connection is declared dead after `factor` ping intervals pass
    /// with no inbound traffic at all.
    pub fn keepalive_factor(mut self, factor: u32) -> Self {
        self.keepalive_factor = factor.max(1);
        self
    }

    pub fn transmission(mut self, parameters: TransmissionParameters) -> Self {
        self.transmission = parameters;
        self
    }

    /// PSK material for DTLS transports.  The message engine never reads
    /// these; they exist to be handed to a [`crate::transport::Transport`]
    /// implementation that understands them.
    pub fn security(mut self, parameters: DtlsParameters) -> Self {
        self.security = Some(parameters);
        self
    }

    pub fn security_parameters(&self) -> Option<&DtlsParameters> {
        self.security.as_ref()
    }
}

/// Pre-shared-key DTLS parameters, passed through verbatim to the transport.
#[derive(Debug, Clone)]
pub struct DtlsParameters {
    pub psk: Vec<u8>,
    pub psk_hint: String,
    pub cipher_suite: Option<u16>,
}

/// Ack timeout and retry policy for confirmable messages.
///
/// Default values come from the
/// [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8).
#[derive(Debug, Clone, Copy)]
pub struct TransmissionParameters {
    pub(crate) ack_timeout: Duration,
    pub(crate) ack_random_factor: f32,
    pub(crate) max_retransmit: usize,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl TransmissionParameters {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        Ok(Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
        })
    }

    /// Range the initial retransmission timeout is drawn from.
    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        let timeout_low = self.ack_timeout;
        if self.ack_random_factor != 1.0 {
            let timeout_high = timeout_low.mul_f32(self.ack_random_factor);
            timeout_low..=timeout_high
        } else {
            timeout_low..=timeout_low
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(TransmissionParameters::new(Duration::from_secs(2), 0.9, 4).is_err());
        assert!(TransmissionParameters::new(Duration::ZERO, 1.5, 4).is_err());
        TransmissionParameters::new(Duration::from_secs(2), 1.0, 0).unwrap();
    }

    #[test]
    fn timeout_range_applies_random_factor() {
        let parameters = TransmissionParameters::new(Duration::from_secs(2), 1.5, 4).unwrap();
        let range = parameters.ack_timeout_range();
        assert_eq!(*range.start(), Duration::from_secs(2));
        assert_eq!(*range.end(), Duration::from_secs(3));

        let fixed = TransmissionParameters::new(Duration::from_secs(2), 1.0, 4).unwrap();
        assert_eq!(
            fixed.ack_timeout_range(),
            Duration::from_secs(2)..=Duration::from_secs(2)
        );
    }

    #[test]
    fn keepalive_factor_has_a_floor() {
        let settings = Settings::new().keepalive_factor(0);
        assert_eq!(settings.keepalive_factor, 1);
    }
}
