//! Per-sensor pulse counting and flow-rate estimation.
//!
//! Pulses arrive from a GPIO interrupt while the main loop prunes and reads
//! the same log. All state sits behind one critical-section mutex and the log
//! is fixed storage, so a [`SensorSampler`] can live in a `static` shared with
//! the ISR and registering a pulse never allocates:
//!
//! ```text
//! static FLOW_A: SensorSampler = SensorSampler::new(SensorConfig::DEFAULT);
//!
//! #[interrupt]
//! fn GPIO() {
//!     FLOW_A.register_pulse(now());
//! }
//! ```
//!
//! # Packetized averaging
//!
//! The raw rate (`pulses * 60000 / window`) jumps by a whole pulse's worth
//! every time a pulse enters or leaves the window. The processed rate splits
//! the window into packets sized to the current pulse count, averages the
//! count per packet with rounding, and scales back up:
//!
//! ```text
//! total         = pulses within window            (0 => rate 0)
//! packets       = clamp(ceil(total / min_pulses_per_packet), 1, max_packets)
//! effective     = window - window % packets
//! packet_len    = effective / packets
//! bucket[i]    += 1  for each pulse within effective, i = min(age / packet_len, packets - 1)
//! avg           = (sum(bucket) + packets / 2) / packets
//! rate          = avg * packets * 60000 / effective
//! ```
//!
//! Pulses older than `effective` are pruned for good, not just skipped.

use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use heapless::Deque;

use crate::config::{SensorConfig, DEFAULT_MAX_PULSES};
use crate::time::{Duration, Timestamp};
use crate::traits::ChannelMutex;
use crate::types::{ConfigKind, SensorReading};

const MS_PER_MINUTE: u64 = 60_000;

struct SamplerState<const N: usize> {
    log: Deque<Timestamp, N>,
    last_pulse: Option<Timestamp>,
    config: SensorConfig,
}

impl<const N: usize> SamplerState<N> {
    /// Drop pulses more than `window` old. A pulse exactly `window` old stays.
    fn prune(&mut self, window: Duration, now: Timestamp) -> usize {
        let mut removed = 0;
        while self.log.front().is_some_and(|t| now - *t > window) {
            self.log.pop_front();
            removed += 1;
        }
        removed
    }
}

/// Breakdown behind one processed-rate computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketStats {
    pub packets: u64,
    pub effective_window: Duration,
    pub packet_len: Duration,
    /// Pulse count per packet, newest packet first.
    pub buckets: Vec<u32>,
}

impl PacketStats {
    /// Average pulses per packet, rounded half up.
    pub fn average(&self) -> u64 {
        let sum: u64 = self.buckets.iter().map(|b| u64::from(*b)).sum();
        (sum + self.packets / 2) / self.packets
    }

    /// Smoothed pulses per minute.
    pub fn rate(&self) -> u64 {
        self.average() * self.packets * MS_PER_MINUTE / self.effective_window.as_millis()
    }
}

/// One physical flow sensor keeping at most `N` pulse timestamps.
///
/// Size `N` from [`NetworkConfig::MAX_PULSES_PER_SENSOR`](crate::config::NetworkConfig),
/// e.g. `SensorSampler<{ SmallConfig::MAX_PULSES_PER_SENSOR }>`.
pub struct SensorSampler<const N: usize = DEFAULT_MAX_PULSES> {
    state: Mutex<ChannelMutex, RefCell<SamplerState<N>>>,
}

impl<const N: usize> SensorSampler<N> {
    pub const fn new(config: SensorConfig) -> Self {
        Self {
            state: Mutex::new(RefCell::new(SamplerState {
                log: Deque::new(),
                last_pulse: None,
                config,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SamplerState<N>) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    /// Count one edge. Safe to call from interrupt context.
    ///
    /// Edges closer than the debounce interval to the last counted pulse are
    /// contact bounce and ignored. Returns whether the pulse was counted.
    pub fn register_pulse(&self, now: Timestamp) -> bool {
        self.with(|s| {
            if let Some(last) = s.last_pulse {
                if now - last < s.config.debounce {
                    return false;
                }
            }
            if s.log.is_full() {
                s.log.pop_front();
            }
            // Cannot fail: a slot was freed above.
            let _ = s.log.push_back(now);
            s.last_pulse = Some(now);
            true
        })
    }

    /// Drop pulses older than `window`. Returns how many were dropped.
    pub fn prune_old(&self, window: Duration, now: Timestamp) -> usize {
        self.with(|s| s.prune(window, now))
    }

    /// Pulses currently in the log, without pruning.
    pub fn pulse_count(&self) -> usize {
        self.with(|s| s.log.len())
    }

    /// Raw rate: pulses within the window scaled to a minute.
    pub fn pulses_per_minute(&self, now: Timestamp) -> u64 {
        self.with(|s| {
            let window = s.config.window;
            s.prune(window, now);
            s.log.len() as u64 * MS_PER_MINUTE / s.config.window_ms()
        })
    }

    /// Packet breakdown at `now`, or `None` when the window holds no pulses.
    pub fn packet_stats(&self, now: Timestamp) -> Option<PacketStats> {
        self.with(|s| {
            let window_ms = s.config.window_ms();
            s.prune(Duration::from_millis(window_ms), now);
            let total = s.log.len() as u64;
            if total == 0 {
                return None;
            }

            let min_per_packet = u64::from(s.config.min_pulses_per_packet.max(1));
            let max_packets = u64::from(s.config.max_packets.max(1));
            // Capped at the window length so a packet is never shorter than 1 ms.
            let packets = total
                .div_ceil(min_per_packet)
                .clamp(1, max_packets)
                .min(window_ms);
            let effective_ms = window_ms - window_ms % packets;
            let packet_ms = effective_ms / packets;
            let effective_window = Duration::from_millis(effective_ms);
            s.prune(effective_window, now);

            let mut buckets = vec![0u32; packets as usize];
            for t in s.log.iter() {
                let age = (now - *t).as_millis();
                let index = (age / packet_ms).min(packets - 1) as usize;
                buckets[index] += 1;
            }

            Some(PacketStats {
                packets,
                effective_window,
                packet_len: Duration::from_millis(packet_ms),
                buckets,
            })
        })
    }

    /// Smoothed rate in pulses per minute, saturated to the wire width.
    pub fn processed_pulses_per_minute(&self, now: Timestamp) -> u16 {
        self.packet_stats(now)
            .map_or(0, |stats| stats.rate().min(u64::from(u16::MAX)) as u16)
    }

    /// Time since the last counted pulse, zero if there has been none.
    pub fn last_pulse_age(&self, now: Timestamp) -> Duration {
        self.with(|s| s.last_pulse.map_or(Duration::ZERO, |last| now - last))
    }

    /// Rate and age as reported to the coordinator.
    pub fn reading(&self, now: Timestamp) -> SensorReading {
        SensorReading {
            pulse_rate: self.processed_pulses_per_minute(now),
            last_pulse_age_ms: self.last_pulse_age(now).as_millis_u32(),
        }
    }

    pub fn config(&self) -> SensorConfig {
        self.with(|s| s.config)
    }

    /// Apply one remotely-set parameter.
    pub fn apply_config(&self, kind: ConfigKind, value: u16) {
        self.with(|s| s.config.apply(kind, value));
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ms(n: u64) -> Timestamp {
        Timestamp::from_millis(n)
    }

    fn sampler(window: u16, min: u16, max: u16) -> SensorSampler {
        let s = SensorSampler::new(SensorConfig::default());
        s.apply_config(ConfigKind::Window, window);
        s.apply_config(ConfigKind::MinPulsesPerPacket, min);
        s.apply_config(ConfigKind::MaxPackets, max);
        s.apply_config(ConfigKind::Debounce, 0);
        s
    }

    fn feed(s: &SensorSampler, times: &[u64]) {
        for t in times {
            assert!(s.register_pulse(ms(*t)));
        }
    }

    #[test]
    fn test_debounce_ignores_bounce() {
        let s: SensorSampler = SensorSampler::new(SensorConfig::default());
        assert!(s.register_pulse(ms(100)));
        assert!(!s.register_pulse(ms(102)));
        assert!(!s.register_pulse(ms(104)));
        // Bounce does not move the reference point.
        assert!(s.register_pulse(ms(105)));
        assert_eq!(s.pulse_count(), 2);
    }

    #[test]
    fn test_prune_keeps_pulse_exactly_window_old() {
        let s = sampler(1000, 3, 5);
        feed(&s, &[0, 1, 500]);
        assert_eq!(s.prune_old(Duration::from_millis(1000), ms(1001)), 1);
        assert_eq!(s.pulse_count(), 2);
        assert_eq!(s.prune_old(Duration::from_millis(1000), ms(1001)), 0);
    }

    #[test]
    fn test_simple_rate() {
        let s = sampler(2500, 3, 5);
        feed(&s, &[100, 600, 1100, 1600, 2100]);
        // 5 pulses in 2.5 s
        assert_eq!(s.pulses_per_minute(ms(2200)), 120);
        assert_eq!(s.pulses_per_minute(ms(10_000)), 0);
    }

    #[test]
    fn test_zero_pulses_reads_zero() {
        let s = sampler(2500, 3, 5);
        assert_eq!(s.processed_pulses_per_minute(ms(5000)), 0);
        assert_eq!(s.packet_stats(ms(5000)), None);
        assert_eq!(s.last_pulse_age(ms(5000)), Duration::ZERO);
    }

    #[test]
    fn test_packetized_rate_worked_example() {
        // window 2500, 7 pulses, 3 per packet -> 3 packets
        // effective = 2500 - 2500 % 3 = 2499, packet_len = 833
        let s = sampler(2500, 3, 5);
        feed(&s, &[10, 400, 900, 1300, 1700, 2100, 2400]);
        let now = ms(2500);

        let stats = s.packet_stats(now).unwrap();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.effective_window, Duration::from_millis(2499));
        assert_eq!(stats.packet_len, Duration::from_millis(833));
        // The pulse at t=10 is 2490 old and still inside 2499.
        // ages 100 400 800 | 1200 1600 | 2100 2490
        assert_eq!(stats.buckets, vec![3, 2, 2]);
        // avg = (7 + 1) / 3 = 2, rate = 2 * 3 * 60000 / 2499 = 144
        assert_eq!(stats.average(), 2);
        assert_eq!(s.processed_pulses_per_minute(now), 144);
        // Raw rate for comparison: 7 * 60000 / 2500
        assert_eq!(s.pulses_per_minute(now), 168);
    }

    #[test]
    fn test_effective_window_prune_is_permanent() {
        // 3 pulses, 1 per packet -> 3 packets, effective = 1000 - 1 = 999
        let s = sampler(1000, 1, 3);
        feed(&s, &[0, 400, 800]);
        let now = ms(1000);
        // Pulse at 0 is 1000 old: inside the window, outside 999.
        assert_eq!(s.pulses_per_minute(now), 180);
        let stats = s.packet_stats(now).unwrap();
        assert_eq!(stats.effective_window, Duration::from_millis(999));
        assert_eq!(stats.buckets.iter().sum::<u32>(), 2);
        assert_eq!(s.pulse_count(), 2);
    }

    #[test]
    fn test_packet_count_capped() {
        let s = sampler(2500, 1, 5);
        let times: Vec<u64> = (0..20).map(|i| 1000 + i * 50).collect();
        feed(&s, &times);
        let stats = s.packet_stats(ms(2000)).unwrap();
        assert_eq!(stats.packets, 5);
        assert_eq!(stats.effective_window, Duration::from_millis(2500));
        // ages 50..=1000 in steps of 50, packet_len 500
        assert_eq!(stats.buckets, vec![9, 10, 1, 0, 0]);
        // avg = (20 + 2) / 5 = 4, rate = 4 * 5 * 60000 / 2500 = 480
        assert_eq!(stats.rate(), 480);
    }

    #[test]
    fn test_tiny_window_never_divides_by_zero() {
        let s = sampler(2, 1, 5);
        feed(&s, &[100, 101, 102]);
        let stats = s.packet_stats(ms(102)).unwrap();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.packet_len, Duration::from_millis(1));
        assert_eq!(stats.buckets, vec![1, 2]);
        assert_eq!(s.processed_pulses_per_minute(ms(102)), u16::MAX);
    }

    #[test]
    fn test_rate_saturates() {
        let s = sampler(1, 1, 1);
        feed(&s, &[5, 6]);
        // 2 pulses within 1 ms window -> 120000/min, over u16.
        assert_eq!(s.processed_pulses_per_minute(ms(6)), u16::MAX);
    }

    #[test]
    fn test_last_pulse_age_and_reading() {
        let s = sampler(2500, 3, 5);
        feed(&s, &[1000]);
        assert_eq!(s.last_pulse_age(ms(1750)), Duration::from_millis(750));
        let reading = s.reading(ms(1750));
        assert_eq!(reading.last_pulse_age_ms, 750);
        // One pulse, one packet: same as raw rate 60000/2500.
        assert_eq!(reading.pulse_rate, 24);
        // Age keeps growing after the pulse leaves the window.
        assert_eq!(s.reading(ms(100_000)).last_pulse_age_ms, 99_000);
    }

    #[test]
    fn test_log_bounded() {
        let s: SensorSampler<4> = SensorSampler::new(SensorConfig::default());
        s.apply_config(ConfigKind::Debounce, 0);
        for t in 0..10 {
            s.register_pulse(ms(t * 10));
        }
        assert_eq!(s.pulse_count(), 4);
        // The newest four survive.
        assert_eq!(s.prune_old(Duration::from_millis(30), ms(90)), 0);
        assert_eq!(s.prune_old(Duration::from_millis(20), ms(90)), 1);
    }

    #[test]
    fn test_pulses_from_another_thread_are_never_lost() {
        const PULSES: usize = 4096;
        let s: SensorSampler<PULSES> = SensorSampler::new(SensorConfig::DEFAULT);
        s.apply_config(ConfigKind::Debounce, 0);
        s.apply_config(ConfigKind::Window, 60_000);
        let now = ms(PULSES as u64 + 1000);

        // One thread stands in for the pulse interrupt, the other for the main loop.
        std::thread::scope(|scope| {
            let isr = scope.spawn(|| {
                (0..PULSES as u64)
                    .filter(|t| s.register_pulse(ms(*t)))
                    .count()
            });
            while !isr.is_finished() {
                s.processed_pulses_per_minute(now);
                s.prune_old(Duration::from_millis(60_000), now);
            }
            assert_eq!(isr.join().unwrap(), PULSES);
        });

        assert_eq!(s.pulse_count(), PULSES);
        let stats = s.packet_stats(now).unwrap();
        assert_eq!(stats.buckets.iter().sum::<u32>(), PULSES as u32);
    }

    proptest! {
        #[test]
        fn prop_prune_idempotent(
            mut times in prop::collection::vec(0u64..10_000, 0..64),
            window in 1u64..5_000,
            now in 0u64..12_000,
        ) {
            times.sort_unstable();
            let s = sampler(2500, 3, 5);
            for t in &times {
                s.register_pulse(ms(*t));
            }
            let w = Duration::from_millis(window);
            s.prune_old(w, ms(now));
            let after_first = s.pulse_count();
            prop_assert_eq!(s.prune_old(w, ms(now)), 0);
            prop_assert_eq!(s.pulse_count(), after_first);
        }

        #[test]
        fn prop_empty_window_reads_zero(
            window in 1u16..10_000,
            min in 0u16..20,
            max in 0u16..20,
            now in 0u64..100_000,
        ) {
            let s = sampler(window, min, max);
            if now > u64::from(window) + 10 {
                s.register_pulse(ms(0));
                s.register_pulse(ms(10));
            }
            prop_assert_eq!(s.processed_pulses_per_minute(ms(now)), 0);
        }

        #[test]
        fn prop_single_packet_matches_raw_rate(
            mut times in prop::collection::vec(0u64..2_500, 1..32),
            window in 100u16..2_500,
        ) {
            times.sort_unstable();
            times.dedup();
            let now = 2_500u64;
            let s = sampler(window, 64, 5);
            for t in &times {
                s.register_pulse(ms(*t));
            }
            let raw = s.pulses_per_minute(ms(now));
            let total = s.pulse_count() as u64;
            prop_assume!(total > 0);
            // min_pulses_per_packet >= total, so one packet spans the whole window.
            prop_assert_eq!(u64::from(s.processed_pulses_per_minute(ms(now))), raw);
        }
    }
}
