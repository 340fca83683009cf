//! End-to-end routing: framed notifications in, typed readings out.

use futures::stream;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use athena_rs::clock::StreamKind;
use athena_rs::protocol::{EEG_SCALE, NOTIFICATION_HEADER_LEN};
use athena_rs::router::{pump, reading_channels, ReadingReceivers, StreamRouter};
use athena_rs::types::{EegReading, RawNotification};

const T0: f64 = 1_700_000_000_000.0;
const EEG_INTERVAL: f64 = 1000.0 / 256.0 * 2.0;

/// Pack `values` LSB-first at `width` bits.
fn pack(values: &[u32], width: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut acc: u64 = 0;
    let mut held = 0;
    for &v in values {
        acc |= u64::from(v) << held;
        held += width;
        while held >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            held -= 8;
        }
    }
    if held > 0 {
        out.push(acc as u8);
    }
    out
}

fn eeg_packet(raw: u32) -> Vec<u8> {
    let mut p = vec![0x12, 0, 0, 0, 0];
    p.extend(pack(&[raw; 16], 14));
    p
}

fn notification(counter: u8, body: &[u8], at: f64) -> RawNotification {
    let mut data = vec![0u8; NOTIFICATION_HEADER_LEN];
    data[1] = counter;
    data.extend_from_slice(body);
    RawNotification::new(data, at)
}

fn drain_eeg(rx: &mut ReadingReceivers) -> Vec<EegReading> {
    std::iter::from_fn(|| rx.eeg.try_recv().ok()).collect()
}

#[test]
fn unknown_tag_between_packets_is_skipped() {
    let (tx, mut rx) = reading_channels();
    let mut router = StreamRouter::new(tx);

    let mut body = eeg_packet(8192 + 100);
    body.push(0xEE);
    body.extend(eeg_packet(8192 - 100));

    let summary = router.route(&notification(7, &body, T0));
    assert_eq!(summary.packets, 2);
    assert_eq!(summary.unknown_tags, 1);
    assert_eq!(summary.partial, 0);

    let readings = drain_eeg(&mut rx);
    assert_eq!(readings.len(), 16);
    assert!((readings[0].samples[0] - 100.0 * EEG_SCALE).abs() < 1e-9);
    assert!((readings[15].samples[1] + 100.0 * EEG_SCALE).abs() < 1e-9);
    // Two packets in one notification advance the clock twice.
    assert_eq!(readings[8].timestamp - readings[0].timestamp, EEG_INTERVAL);
}

#[test]
fn silence_reanchors_to_arrival_time() {
    let (tx, mut rx) = reading_channels();
    let mut router = StreamRouter::new(tx);

    router.route(&notification(0, &eeg_packet(8192), T0));
    router.route(&notification(1, &eeg_packet(8192), T0 + 8.0));
    router.route(&notification(2, &eeg_packet(8192), T0 + 2_000.0));

    let stamps: Vec<f64> = drain_eeg(&mut rx)
        .into_iter()
        .filter(|r| r.electrode == 0)
        .map(|r| r.timestamp)
        .collect();
    assert_eq!(
        stamps,
        vec![T0 - EEG_INTERVAL, T0, T0 + 2_000.0 - EEG_INTERVAL]
    );
}

#[test]
fn silence_after_a_burst_reanchors_to_the_wall_clock() {
    let (tx, mut rx) = reading_channels();
    let mut router = StreamRouter::new(tx);

    // A burst delivered at one instant runs the clock ahead of the wall.
    for i in 0..100u8 {
        router.route(&notification(i, &eeg_packet(8192), T0));
    }
    let ahead = router
        .clocks()
        .clock(StreamKind::Bioelectric)
        .last_timestamp
        .unwrap();
    assert!(ahead > T0 + 600.0);

    router.route(&notification(100, &eeg_packet(8192), T0 + 600.0));
    let last = drain_eeg(&mut rx).last().unwrap().timestamp;
    assert_eq!(last, T0 + 600.0 - EEG_INTERVAL);
}

#[test]
fn slow_stream_stays_near_the_wall_clock() {
    let (tx, mut rx) = reading_channels();
    let mut router = StreamRouter::new(tx);

    for i in 0..20u8 {
        let now = T0 + f64::from(i) * 400.0;
        router.route(&notification(i, &eeg_packet(8192), now));
        let ts = drain_eeg(&mut rx).last().unwrap().timestamp;
        assert!(now - ts <= 500.0 + EEG_INTERVAL, "lag {}", now - ts);
    }
}

#[test]
fn streams_keep_independent_clocks() {
    let (tx, mut rx) = reading_channels();
    let mut router = StreamRouter::new(tx);

    let mut body = eeg_packet(8192);
    body.extend([0x47, 0, 0, 0, 0]);
    body.extend([0u8; 36]);
    router.route(&notification(0, &body, T0));

    let eeg = drain_eeg(&mut rx);
    let imu: Vec<_> = std::iter::from_fn(|| rx.imu.try_recv().ok()).collect();
    assert_eq!(eeg[0].timestamp, T0 - EEG_INTERVAL);
    assert_eq!(imu[0].timestamp, T0 - 1000.0 / 52.0 * 3.0);
    assert!(router.clocks().clock(StreamKind::Optical).last_timestamp.is_none());
}

#[tokio::test]
async fn pump_drains_a_capture() {
    let (tx, mut rx) = reading_channels();
    let mut router = StreamRouter::new(tx);

    let notifs: Vec<_> = (0..10u8)
        .map(|i| notification(i, &eeg_packet(8192), T0 + f64::from(i) * 8.0))
        .collect();
    let total = pump(stream::iter(notifs), &mut router, CancellationToken::new()).await;

    assert_eq!(total.packets, 10);
    assert_eq!(total.published, 80);
    let readings = drain_eeg(&mut rx);
    assert_eq!(readings.len(), 80);
    assert_eq!(readings.last().unwrap().index, 9);
}

proptest! {
    #[test]
    fn timestamps_track_the_wall_clock(gaps in prop::collection::vec(0.0f64..2_000.0, 1..60)) {
        let (tx, mut rx) = reading_channels();
        let mut router = StreamRouter::new(tx);
        let mut now = T0;
        let mut arrivals = Vec::new();
        for (i, gap) in gaps.iter().enumerate() {
            now += gap;
            arrivals.push(now);
            router.route(&notification(i as u8, &eeg_packet(8192), now));
        }
        let stamps: Vec<f64> = drain_eeg(&mut rx)
            .into_iter()
            .filter(|r| r.electrode == 0)
            .map(|r| r.timestamp)
            .collect();
        prop_assert_eq!(stamps.len(), gaps.len());
        for (ts, now) in stamps.iter().zip(&arrivals) {
            prop_assert!(now - ts <= 500.0 + EEG_INTERVAL);
        }
        // Each step either advances by one interval or re-anchors to arrival.
        for i in 1..stamps.len() {
            let advanced = stamps[i] == stamps[i - 1] + EEG_INTERVAL;
            let anchored = stamps[i] == arrivals[i] - EEG_INTERVAL;
            prop_assert!(advanced || anchored);
        }
    }
}
