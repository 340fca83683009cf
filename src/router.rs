//! Fan-out of decoded Athena packets into typed reading channels.
//!
//! [`StreamRouter::route`] is called once per sensor notification, in arrival
//! order, on a single task.  It walks the notification with
//! [`crate::codec::Packets`], stamps each packet through the connection's
//! [`TimestampSynthesizer`], and pushes typed readings onto unbounded
//! channels that the application drains at its own pace.

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::{packet_interval_ms, StreamKind, TimestampSynthesizer};
use crate::codec::{DecodedPacket, EntryKind, PacketKind, Packets};
use crate::protocol::{EEG_CHANNELS, EEG_SAMPLES_PER_PACKET, POWER_VALUES};
use crate::types::{
    EegReading, ImuSample, OpticalReading, PowerReading, RawNotification, XyzSample,
};

// ── Channels ──────────────────────────────────────────────────────────────────

/// Producer halves of the per-kind reading channels.
#[derive(Debug, Clone)]
pub struct ReadingSenders {
    pub eeg: mpsc::UnboundedSender<EegReading>,
    pub imu: mpsc::UnboundedSender<ImuSample>,
    pub optical: mpsc::UnboundedSender<OpticalReading>,
    pub power: mpsc::UnboundedSender<PowerReading>,
}

/// Consumer halves of the per-kind reading channels.
#[derive(Debug)]
pub struct ReadingReceivers {
    pub eeg: mpsc::UnboundedReceiver<EegReading>,
    pub imu: mpsc::UnboundedReceiver<ImuSample>,
    pub optical: mpsc::UnboundedReceiver<OpticalReading>,
    pub power: mpsc::UnboundedReceiver<PowerReading>,
}

/// Create a connected set of reading channels.
pub fn reading_channels() -> (ReadingSenders, ReadingReceivers) {
    let (eeg_tx, eeg_rx) = mpsc::unbounded_channel();
    let (imu_tx, imu_rx) = mpsc::unbounded_channel();
    let (optical_tx, optical_rx) = mpsc::unbounded_channel();
    let (power_tx, power_rx) = mpsc::unbounded_channel();
    (
        ReadingSenders {
            eeg: eeg_tx,
            imu: imu_tx,
            optical: optical_tx,
            power: power_tx,
        },
        ReadingReceivers {
            eeg: eeg_rx,
            imu: imu_rx,
            optical: optical_rx,
            power: power_rx,
        },
    )
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Per-notification tally returned by [`StreamRouter::route`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteSummary {
    /// Packets that decoded into entries.
    pub packets: usize,
    /// Readings pushed to the output channels.
    pub published: usize,
    pub unknown_tags: usize,
    pub partial: usize,
}

impl std::ops::AddAssign for RouteSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.packets += rhs.packets;
        self.published += rhs.published;
        self.unknown_tags += rhs.unknown_tags;
        self.partial += rhs.partial;
    }
}

/// Decodes notifications for one connection and publishes typed readings.
pub struct StreamRouter {
    out: ReadingSenders,
    clocks: TimestampSynthesizer,
}

impl StreamRouter {
    pub fn new(out: ReadingSenders) -> Self {
        Self {
            out,
            clocks: TimestampSynthesizer::new(),
        }
    }

    /// Decode every packet in `notification` and publish the readings.
    ///
    /// Unknown tags and truncated payloads are skipped one byte at a time;
    /// later packets in the same notification are still decoded.
    pub fn route(&mut self, notification: &RawNotification) -> RouteSummary {
        let index = notification.counter().map(u16::from).unwrap_or_default();
        let now = notification.received_at;
        let mut summary = RouteSummary::default();

        for (_, packet) in Packets::new(&notification.data) {
            match packet.kind {
                PacketKind::Unknown => summary.unknown_tags += 1,
                PacketKind::Partial => summary.partial += 1,
                _ => {
                    summary.packets += 1;
                    summary.published += self.publish(&packet, index, now);
                }
            }
        }
        summary
    }

    /// Forget all stream timebases, as on disconnect.
    pub fn reset(&mut self) {
        self.clocks.reset();
    }

    pub fn clocks(&self) -> &TimestampSynthesizer {
        &self.clocks
    }

    fn publish(&mut self, packet: &DecodedPacket, index: u16, now: f64) -> usize {
        let mut stamp = |kind: StreamKind| {
            self.clocks.next_timestamp_at(
                kind,
                index,
                packet.sample_count,
                packet.frequency_hz,
                now,
            )
        };

        match packet.kind {
            PacketKind::Bioelectric => {
                let Some(entry) = packet.entries.first() else {
                    return 0;
                };
                let timestamp = stamp(StreamKind::Bioelectric);
                let mut sent = 0;
                for (electrode, pair) in entry
                    .values
                    .chunks_exact(EEG_SAMPLES_PER_PACKET)
                    .take(EEG_CHANNELS)
                    .enumerate()
                {
                    let reading = EegReading {
                        electrode,
                        index,
                        timestamp,
                        samples: [pair[0], pair[1]],
                    };
                    sent += send(&self.out.eeg, reading);
                }
                sent
            }

            PacketKind::Inertial => {
                let timestamp = stamp(StreamKind::Inertial);
                let step = packet_interval_ms(1, packet.frequency_hz);
                let mut sent = 0;
                let mut linear = packet
                    .entries
                    .iter()
                    .filter(|e| e.kind == EntryKind::InertialLinear);
                let mut angular = packet
                    .entries
                    .iter()
                    .filter(|e| e.kind == EntryKind::InertialAngular);
                let mut i = 0;
                while let (Some(a), Some(g)) = (linear.next(), angular.next()) {
                    let sample = ImuSample {
                        index,
                        timestamp: timestamp + step * i as f64,
                        accel: XyzSample::from_slice(&a.values),
                        gyro: XyzSample::from_slice(&g.values),
                    };
                    sent += send(&self.out.imu, sample);
                    i += 1;
                }
                sent
            }

            PacketKind::Optical => {
                let timestamp = stamp(StreamKind::Optical);
                let step = packet_interval_ms(1, packet.frequency_hz);
                let mut sent = 0;
                for (channel, entry) in packet.entries.iter().enumerate() {
                    let mut samples = [0.0; 4];
                    for (dst, &v) in samples.iter_mut().zip(&entry.values) {
                        *dst = v;
                    }
                    let reading = OpticalReading {
                        index,
                        channel,
                        timestamp: timestamp + step * channel as f64,
                        samples,
                    };
                    sent += send(&self.out.optical, reading);
                }
                sent
            }

            PacketKind::Power => {
                let Some(entry) = packet.entries.first() else {
                    return 0;
                };
                let mut values = [0u16; POWER_VALUES];
                for (dst, &v) in values.iter_mut().zip(&entry.values) {
                    *dst = v as u16;
                }
                send(&self.out.power, PowerReading { timestamp: now, values })
            }

            // DRL/REF levels have no public reading type yet.
            PacketKind::Reference => 0,

            PacketKind::Unknown | PacketKind::Partial => 0,
        }
    }
}

fn send<T>(tx: &mpsc::UnboundedSender<T>, value: T) -> usize {
    match tx.send(value) {
        Ok(()) => 1,
        Err(_) => {
            debug!("reading dropped: consumer closed its channel");
            0
        }
    }
}

/// Route every notification from `notifications` until the stream ends or
/// `cancel` fires.  Stream clocks are reset on the way out.
pub async fn pump<S>(
    mut notifications: S,
    router: &mut StreamRouter,
    cancel: CancellationToken,
) -> RouteSummary
where
    S: Stream<Item = RawNotification> + Unpin,
{
    let mut total = RouteSummary::default();
    let mut count: u64 = 0;

    loop {
        let notif = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Athena: router cancelled after {count} notifications");
                break;
            }
            next = notifications.next() => match next {
                Some(n) => n,
                None => {
                    info!("Athena: notification stream ended after {count} notifications");
                    break;
                }
            },
        };

        count += 1;
        let summary = router.route(&notif);
        if count <= 3 || count % 500 == 0 {
            info!(
                "Athena sensor: notif #{count} len={} packets={} published={} unknown={} partial={}",
                notif.data.len(),
                summary.packets,
                summary.published,
                summary.unknown_tags,
                summary.partial,
            );
        }
        if summary.partial > 0 {
            warn!(
                "Athena: notif #{count} had {} truncated packet(s)",
                summary.partial
            );
        }
        total += summary;
    }

    router.reset();
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NOTIFICATION_HEADER_LEN;

    const T0: f64 = 1_700_000_000_000.0;

    fn header(counter: u8) -> Vec<u8> {
        let mut h = vec![0u8; NOTIFICATION_HEADER_LEN];
        h[1] = counter;
        h
    }

    fn packet(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![tag, 0, 0, 0, 0];
        v.extend_from_slice(payload);
        v
    }

    fn eeg_packet() -> Vec<u8> {
        // Every 14-bit field = 0x2000 + 0x100 → +256 LSB above zero.
        let raw = vec![0x2100u32; 16];
        let mut bits: u128 = 0;
        let mut held = 0;
        let mut out = Vec::new();
        for v in raw {
            bits |= u128::from(v) << held;
            held += 14;
            while held >= 8 {
                out.push((bits & 0xff) as u8);
                bits >>= 8;
                held -= 8;
            }
        }
        packet(0x12, &out)
    }

    fn imu_packet() -> Vec<u8> {
        let raw: Vec<i16> = (0..18).map(|i| i * 100).collect();
        let payload: Vec<u8> = raw.iter().flat_map(|v| v.to_le_bytes()).collect();
        packet(0x47, &payload)
    }

    #[test]
    fn eeg_channels_share_one_timestamp() {
        let (tx, mut rx) = reading_channels();
        let mut router = StreamRouter::new(tx);

        let mut data = header(42);
        data.extend(eeg_packet());
        let summary = router.route(&RawNotification::new(data, T0));

        assert_eq!(summary.packets, 1);
        assert_eq!(summary.published, 8);

        let mut seen = Vec::new();
        while let Ok(r) = rx.eeg.try_recv() {
            seen.push(r);
        }
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|r| r.timestamp == seen[0].timestamp));
        assert!(seen.iter().all(|r| r.index == 42));
        assert_eq!(seen[0].timestamp, T0 - 7.8125);
        assert_eq!(
            seen.iter().map(|r| r.electrode).collect::<Vec<_>>(),
            (0..8).collect::<Vec<_>>()
        );
        assert!((seen[3].samples[1] - 256.0 * 0.0885).abs() < 1e-9);
    }

    #[test]
    fn imu_samples_are_spaced_within_a_packet() {
        let (tx, mut rx) = reading_channels();
        let mut router = StreamRouter::new(tx);

        let mut data = header(0);
        data.extend(imu_packet());
        router.route(&RawNotification::new(data, T0));

        let samples: Vec<ImuSample> = std::iter::from_fn(|| rx.imu.try_recv().ok()).collect();
        assert_eq!(samples.len(), 3);
        let step = 1000.0 / 52.0;
        assert!((samples[1].timestamp - samples[0].timestamp - step).abs() < 1e-6);
        assert!((samples[2].accel.x - 1200.0 * 6.10352e-5).abs() < 1e-9);
        assert!((samples[2].gyro.z - 1700.0 * -7.4768e-3).abs() < 1e-9);
    }

    #[test]
    fn mixed_notification_fans_out_by_kind() {
        let (tx, mut rx) = reading_channels();
        let mut router = StreamRouter::new(tx);

        let mut data = header(1);
        data.extend(eeg_packet());
        data.push(0x27); // unknown
        data.extend(imu_packet());
        data.extend(packet(0x88, &[0x01, 0x00].repeat(10)));
        data.extend(packet(0x34, &[0u8; 30]));
        data.extend(packet(0x13, &[0u8; 7]));
        data.extend(&[0x12, 0, 0]); // truncated tail, then two zero bytes read as unknown tags

        let summary = router.route(&RawNotification::new(data, T0));
        assert_eq!(summary.packets, 5);
        assert_eq!(summary.unknown_tags, 3);
        assert_eq!(summary.partial, 1);
        assert_eq!(summary.published, 8 + 3 + 1 + 3);

        let power = rx.power.try_recv().unwrap();
        assert_eq!(power.values, [1u16; 10]);
        assert_eq!(power.timestamp, T0);
        assert_eq!(
            std::iter::from_fn(|| rx.optical.try_recv().ok())
                .map(|o| o.channel)
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn optical_samples_are_spaced_and_hold_four_channels() {
        let (tx, mut rx) = reading_channels();
        let mut router = StreamRouter::new(tx);

        // Sample s, channel c carries raw value 100 * s + c.
        let raw: Vec<u32> = (0..3).flat_map(|s| (0..4).map(move |c| 100 * s + c)).collect();
        // 12 × 20 bits: each half of six values fills exactly 15 bytes.
        let mut payload = Vec::new();
        for half in raw.chunks(6) {
            let mut acc: u128 = 0;
            for (i, v) in half.iter().enumerate() {
                acc |= u128::from(*v) << (i * 20);
            }
            payload.extend_from_slice(&acc.to_le_bytes()[..15]);
        }

        let mut data = header(3);
        data.extend(packet(0x34, &payload));
        router.route(&RawNotification::new(data, T0));

        let readings: Vec<OpticalReading> =
            std::iter::from_fn(|| rx.optical.try_recv().ok()).collect();
        assert_eq!(readings.len(), 3);
        let step = 1000.0 / 64.0;
        assert_eq!(readings[0].timestamp, T0 - 3.0 * step);
        assert_eq!(readings[1].timestamp - readings[0].timestamp, step);
        assert_eq!(readings[2].timestamp - readings[0].timestamp, 2.0 * step);
        // Second sample's infrared value is raw 101.
        assert_eq!(readings[1].samples[1], 101.0 / 32768.0);
        assert_eq!(readings[2].samples[3], 203.0 / 32768.0);
    }

    #[test]
    fn reset_forgets_clocks() {
        let (tx, _rx) = reading_channels();
        let mut router = StreamRouter::new(tx);
        let mut data = header(0);
        data.extend(eeg_packet());
        router.route(&RawNotification::new(data, T0));
        assert!(router.clocks().clock(StreamKind::Bioelectric).last_timestamp.is_some());
        router.reset();
        assert!(router.clocks().clock(StreamKind::Bioelectric).last_timestamp.is_none());
    }

    #[test]
    fn closed_consumer_does_not_stop_routing() {
        let (tx, rx) = reading_channels();
        drop(rx);
        let mut router = StreamRouter::new(tx);
        let mut data = header(0);
        data.extend(eeg_packet());
        let summary = router.route(&RawNotification::new(data, T0));
        assert_eq!(summary.packets, 1);
        assert_eq!(summary.published, 0);
    }

    #[tokio::test]
    async fn pump_routes_until_stream_ends_then_resets() {
        let (tx, mut rx) = reading_channels();
        let mut router = StreamRouter::new(tx);

        let notifs: Vec<RawNotification> = (0..3u8)
            .map(|i| {
                let mut d = header(i);
                d.extend(eeg_packet());
                RawNotification::new(d, T0 + f64::from(i) * 10.0)
            })
            .collect();

        let total = pump(
            futures::stream::iter(notifs),
            &mut router,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(total.packets, 3);
        assert_eq!(total.published, 24);
        assert!(router.clocks().clock(StreamKind::Bioelectric).last_timestamp.is_none());

        let stamps: Vec<f64> = std::iter::from_fn(|| rx.eeg.try_recv().ok())
            .filter(|r| r.electrode == 0)
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(stamps, vec![T0 - 7.8125, T0, T0 + 7.8125]);
    }

    #[tokio::test]
    async fn pump_stops_on_cancel() {
        let (tx, _rx) = reading_channels();
        let mut router = StreamRouter::new(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let total = pump(futures::stream::pending(), &mut router, cancel).await;
        assert_eq!(total, RouteSummary::default());
    }
}
