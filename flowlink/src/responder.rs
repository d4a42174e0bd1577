//! Sensor-node side of data collection and remote configuration.

use log::{debug, info};

use crate::link::Link;
use crate::config::DEFAULT_MAX_PULSES;
use crate::sampler::SensorSampler;
use crate::time::Timestamp;
use crate::traits::Transport;
use crate::types::{ConfigKind, Error, MacAddr, NodeId, SensorReadings, MAX_SENSORS_PER_NODE};
use crate::wire::{ConfigUpdate, Message};

/// Answers data requests and applies configuration for up to nine local sensors.
///
/// Sensor order is fixed at construction and is the order readings are
/// reported in.
pub struct SecondaryResponder<'a, const P: usize = DEFAULT_MAX_PULSES> {
    sensors: &'a [SensorSampler<P>],
}

impl<'a, const P: usize> SecondaryResponder<'a, P> {
    pub fn new(sensors: &'a [SensorSampler<P>]) -> Result<Self, Error> {
        if sensors.len() > MAX_SENSORS_PER_NODE {
            return Err(Error::TooManySensors {
                count: sensors.len(),
            });
        }
        Ok(Self { sensors })
    }

    pub fn sensors(&self) -> &'a [SensorSampler<P>] {
        self.sensors
    }

    /// Current reading of every local sensor.
    pub fn readings(&self, now: Timestamp) -> SensorReadings {
        let mut out = SensorReadings::new();
        for sensor in self.sensors {
            // len <= MAX_SENSORS_PER_NODE is checked in new()
            let _ = out.push(sensor.reading(now));
        }
        out
    }

    /// Reply to a data request from `to`.
    pub fn handle_data_request<T: Transport, H>(&self, link: &Link<T, H>, to: &NodeId, now: Timestamp) {
        let readings = self.readings(now);
        debug!("reporting {} sensors to {}", readings.len(), MacAddr(*to));
        link.send_message(to, &Message::DataResponse(readings));
    }

    /// Apply `update` to every selected sensor. Returns how many changed.
    ///
    /// Selection bits past the last local sensor are ignored.
    pub fn handle_set_config(&self, kind: ConfigKind, update: ConfigUpdate) -> usize {
        let mut applied = 0;
        for local in update.mask.iter() {
            if let Some(sensor) = self.sensors.get(local) {
                sensor.apply_config(kind, update.value);
                applied += 1;
            }
        }
        info!("{:?} = {} on {} sensors", kind, update.value, applied);
        applied
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::config::SensorConfig;
    use crate::time::Duration;
    use crate::traits::test_impls::MockTransport;
    use crate::types::{MessageType, SelectionMask};
    use crate::wire::Decode;

    const COORD: NodeId = [0xC0, 0, 0, 0, 0, 1];

    fn samplers(n: usize) -> Vec<SensorSampler<64>> {
        (0..n).map(|_| SensorSampler::new(SensorConfig::DEFAULT)).collect()
    }

    #[test]
    fn test_rejects_more_than_nine_sensors() {
        let ten = samplers(10);
        assert_eq!(
            SecondaryResponder::new(&ten).err(),
            Some(Error::TooManySensors { count: 10 })
        );
        let nine = samplers(9);
        assert!(SecondaryResponder::new(&nine).is_ok());
    }

    #[test]
    fn test_data_response_layout() {
        let sensors = samplers(2);
        sensors[0].register_pulse(Timestamp::from_millis(1000));
        let responder = SecondaryResponder::new(&sensors).unwrap();
        let link: Link<MockTransport, ()> = Link::new(MockTransport::new(), 4);
        link.admit(&COORD).unwrap();

        responder.handle_data_request(&link, &COORD, Timestamp::from_millis(1500));
        let sent = link.transport().take_sent();
        assert_eq!(sent.len(), 1);
        let (to, frame) = &sent[0];
        assert_eq!(*to, COORD);
        assert_eq!(frame[0], MessageType::DataResponse.as_u8());

        let readings = SensorReadings::decode_from_slice(&frame[1..]).unwrap();
        // One pulse in a 2.5 s window: 24 per minute, 500 ms old.
        assert_eq!(readings[0].pulse_rate, 24);
        assert_eq!(readings[0].last_pulse_age_ms, 500);
        // Never pulsed.
        assert_eq!(readings[1].pulse_rate, 0);
        assert_eq!(readings[1].last_pulse_age_ms, 0);
    }

    #[test]
    fn test_zero_sensors_answer_empty() {
        let responder: SecondaryResponder<'_> = SecondaryResponder::new(&[]).unwrap();
        let link: Link<MockTransport, ()> = Link::new(MockTransport::new(), 4);
        link.admit(&COORD).unwrap();
        responder.handle_data_request(&link, &COORD, Timestamp::ZERO);
        assert_eq!(link.transport().take_sent(), vec![(COORD, vec![0x91, 0])]);
    }

    #[test]
    fn test_set_config_applies_to_masked_sensors() {
        let sensors = samplers(3);
        let responder = SecondaryResponder::new(&sensors).unwrap();
        let mut mask = SelectionMask::EMPTY;
        mask.set(0);
        mask.set(2);
        // No sensor 8 on this node.
        mask.set(8);

        let applied = responder.handle_set_config(ConfigKind::Window, ConfigUpdate { value: 4000, mask });
        assert_eq!(applied, 2);
        assert_eq!(sensors[0].config().window, Duration::from_millis(4000));
        assert_eq!(sensors[1].config().window, Duration::from_millis(2500));
        assert_eq!(sensors[2].config().window, Duration::from_millis(4000));
    }
}
