//! Control-channel command queue and the Athena start-up handshake.
//!
//! Athena firmware only starts streaming after a fixed command sequence,
//! written one at a time with a pause after each:
//!
//! ```text
//! v4 → s → h → p1045 → dc001 → dc001 → L1 → (settle) → streaming
//! ```
//!
//! `dc001` really is sent twice: a single start command leaves the headset
//! idle.  Back-to-back writes without the pauses are dropped or misread by
//! the device, so the delays in [`CommandTiming`] are part of the protocol.
//!
//! Every write, from the handshake or from a later `pause`/`resume`, goes
//! through one [`CommandQueue`].  The handshake holds the queue for its whole
//! duration, so a pause requested mid-handshake is written after `L1`.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{AthenaError, Result};
use crate::protocol::{Command, Preset};
use crate::transport::ControlChannel;

// ── Timing ────────────────────────────────────────────────────────────────────

/// Pauses observed after each handshake command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTiming {
    pub after_version: Duration,
    pub after_status: Duration,
    pub after_halt: Duration,
    pub after_preset: Duration,
    /// Applied after each of the two start commands.
    pub after_start: Duration,
    /// Wait after the indicator command before packets flow.
    pub settle: Duration,
}

impl Default for CommandTiming {
    fn default() -> Self {
        Self {
            after_version: Duration::from_millis(100),
            after_status: Duration::from_millis(100),
            after_halt: Duration::from_millis(100),
            after_preset: Duration::from_millis(100),
            after_start: Duration::from_millis(50),
            settle: Duration::from_millis(2100),
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Serialises writes to one control channel and refuses them once the
/// connection's cancellation token has fired.
pub struct CommandQueue<C> {
    channel: AsyncMutex<C>,
    cancel: CancellationToken,
}

impl<C: ControlChannel> CommandQueue<C> {
    pub fn new(channel: C, cancel: CancellationToken) -> Self {
        Self {
            channel: AsyncMutex::new(channel),
            cancel,
        }
    }

    /// Take exclusive use of the channel.  Other callers wait until the
    /// returned guard is dropped.
    pub async fn lock(&self) -> Result<QueueGuard<'_, C>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AthenaError::Disconnected),
            channel = self.channel.lock() => Ok(QueueGuard { channel, cancel: &self.cancel }),
        }
    }

    /// Write one command, waiting for any in-progress sequence first.
    pub async fn send(&self, cmd: Command) -> Result<()> {
        self.lock().await?.send(cmd).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Exclusive access to the control channel for a run of commands.
pub struct QueueGuard<'a, C> {
    channel: MutexGuard<'a, C>,
    cancel: &'a CancellationToken,
}

impl<C: ControlChannel> QueueGuard<'_, C> {
    pub async fn send(&mut self, cmd: Command) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AthenaError::Disconnected);
        }
        debug!("control → {cmd}");
        let bytes = cmd.encode();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AthenaError::Disconnected),
            res = self.channel.write(&bytes) => res,
        }
    }

    /// Sleep for `delay` unless the connection drops first.
    pub async fn pause_for(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AthenaError::Disconnected),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Where a [`ConnectionSequencer`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    VersionQuery,
    StatusQuery,
    Halt,
    PresetSelect(Preset),
    /// `attempt` is 1 or 2.
    StreamStart { attempt: u8 },
    IndicatorSet,
    Streaming,
    Paused,
    Stopped,
    /// A write failed or the link dropped; a fresh connection is required.
    Aborted,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerState::PresetSelect(p) => write!(f, "PresetSelect({p})"),
            SequencerState::StreamStart { attempt } => write!(f, "StreamStart#{attempt}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Drives one connection's control channel: the start-up handshake and the
/// later pause / resume / stop commands.
pub struct ConnectionSequencer<C> {
    queue: CommandQueue<C>,
    state: Mutex<SequencerState>,
    preset: Preset,
    timing: CommandTiming,
}

impl<C: ControlChannel> ConnectionSequencer<C> {
    /// `cancel` is the connection's disconnect signal; once it fires every
    /// pending or future command fails with [`AthenaError::Disconnected`].
    pub fn new(channel: C, preset: Preset, timing: CommandTiming, cancel: CancellationToken) -> Self {
        Self {
            queue: CommandQueue::new(channel, cancel),
            state: Mutex::new(SequencerState::Idle),
            preset,
            timing,
        }
    }

    pub fn state(&self) -> SequencerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn preset(&self) -> Preset {
        self.preset
    }

    fn set_state(&self, next: SequencerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!("sequencer: {} → {next}", *state);
            *state = next;
        }
    }

    /// An aborted sequencer writes nothing more; the connection must be
    /// rebuilt.
    fn ensure_live(&self) -> Result<()> {
        if self.state() == SequencerState::Aborted {
            return Err(AthenaError::Disconnected);
        }
        Ok(())
    }

    fn abort(&self, err: AthenaError) -> AthenaError {
        warn!("sequencer: aborted in {}: {err}", self.state());
        self.set_state(SequencerState::Aborted);
        err
    }

    /// The handshake steps: state entered, command written, pause after.
    fn handshake(&self) -> [(SequencerState, Command, Duration); 7] {
        let t = &self.timing;
        [
            (SequencerState::VersionQuery, Command::Version, t.after_version),
            (SequencerState::StatusQuery, Command::Status, t.after_status),
            (SequencerState::Halt, Command::Halt, t.after_halt),
            (
                SequencerState::PresetSelect(self.preset),
                Command::Preset(self.preset),
                t.after_preset,
            ),
            (SequencerState::StreamStart { attempt: 1 }, Command::StartStreaming, t.after_start),
            (SequencerState::StreamStart { attempt: 2 }, Command::StartStreaming, t.after_start),
            (SequencerState::IndicatorSet, Command::Indicator, t.settle),
        ]
    }

    /// Run the full handshake and leave the headset streaming.
    ///
    /// Holds the command queue throughout, so concurrent commands are written
    /// only after the handshake completes or fails.
    pub async fn start(&self) -> Result<()> {
        self.ensure_live()?;
        let mut queue = self.queue.lock().await.map_err(|e| self.abort(e))?;
        info!("sequencer: starting with preset {}", self.preset);

        for (state, cmd, delay) in self.handshake() {
            self.set_state(state);
            queue.send(cmd).await.map_err(|e| self.abort(e))?;
            queue.pause_for(delay).await.map_err(|e| self.abort(e))?;
        }

        self.set_state(SequencerState::Streaming);
        info!("sequencer: streaming");
        Ok(())
    }

    /// Halt streaming.  The stream clocks keep running; the router
    /// re-anchors them when packets resume after the silence.
    pub async fn pause(&self) -> Result<()> {
        self.run(Command::Halt, SequencerState::Paused).await
    }

    /// Resume streaming after [`Self::pause`] with a single start command.
    pub async fn resume(&self) -> Result<()> {
        self.run(Command::StartStreaming, SequencerState::Streaming).await
    }

    /// Halt streaming for good on this connection.
    pub async fn stop(&self) -> Result<()> {
        self.run(Command::Halt, SequencerState::Stopped).await
    }

    /// Write an arbitrary command from the fixed table.
    pub async fn send(&self, cmd: Command) -> Result<()> {
        self.ensure_live()?;
        self.queue.send(cmd).await
    }

    /// Write a command looked up by name; unknown names fail immediately
    /// without touching the channel.
    pub async fn send_named(&self, name: &str) -> Result<()> {
        let cmd = Command::from_name(name)?;
        self.send(cmd).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.queue.is_cancelled()
    }

    async fn run(&self, cmd: Command, next: SequencerState) -> Result<()> {
        match self.send(cmd).await {
            Ok(()) => {
                self.set_state(next);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(self.abort(e)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records writes and fails the test on overlapping writes.
    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<Vec<u8>>>,
        busy: AtomicBool,
        fail_at: Option<usize>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|w| String::from_utf8_lossy(&w[1..w.len() - 1]).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl ControlChannel for Recorder {
        async fn write(&self, bytes: &[u8]) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(n) {
                return Err(AthenaError::transport("write rejected"));
            }
            assert!(!self.busy.swap(true, Ordering::SeqCst), "overlapping write");
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.writes.lock().unwrap().push(bytes.to_vec());
            self.busy.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sequencer(rec: &Arc<Recorder>, cancel: CancellationToken) -> ConnectionSequencer<Arc<Recorder>> {
        ConnectionSequencer::new(rec.clone(), Preset::P1045, CommandTiming::default(), cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_writes_in_order_and_ends_streaming() {
        let rec = Arc::new(Recorder::default());
        let seq = sequencer(&rec, CancellationToken::new());
        assert_eq!(seq.state(), SequencerState::Idle);

        seq.start().await.unwrap();
        assert_eq!(
            rec.commands(),
            ["v4", "s", "h", "p1045", "dc001", "dc001", "L1"]
        );
        assert_eq!(seq.state(), SequencerState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_respects_delays() {
        let rec = Arc::new(Recorder::default());
        let seq = sequencer(&rec, CancellationToken::new());
        let t0 = tokio::time::Instant::now();
        seq.start().await.unwrap();
        // 4 × 100 + 2 × 50 + 2100 of pauses plus 7 × 1 ms of writes
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(2607), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2650), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_stop() {
        let rec = Arc::new(Recorder::default());
        let seq = sequencer(&rec, CancellationToken::new());
        seq.pause().await.unwrap();
        assert_eq!(seq.state(), SequencerState::Paused);
        seq.resume().await.unwrap();
        assert_eq!(seq.state(), SequencerState::Streaming);
        seq.stop().await.unwrap();
        assert_eq!(seq.state(), SequencerState::Stopped);
        assert_eq!(rec.commands(), ["h", "dc001", "h"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_handshake_and_blocks_later_writes() {
        let rec = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let seq = Arc::new(sequencer(&rec, cancel.clone()));

        let task = {
            let seq = seq.clone();
            tokio::spawn(async move { seq.start().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        let res = task.await.unwrap();
        assert!(matches!(res, Err(AthenaError::Disconnected)));
        assert_eq!(seq.state(), SequencerState::Aborted);
        assert_eq!(rec.commands(), ["v4", "s"]);

        assert!(matches!(seq.pause().await, Err(AthenaError::Disconnected)));
        assert_eq!(rec.commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_aborts() {
        let rec = Arc::new(Recorder::failing_at(2));
        let seq = sequencer(&rec, CancellationToken::new());
        let err = seq.start().await.unwrap_err();
        assert!(matches!(err, AthenaError::Transport { .. }));
        assert_eq!(seq.state(), SequencerState::Aborted);
        assert_eq!(rec.commands(), ["v4", "s"]);

        // Nothing reaches the channel once aborted, even though the link
        // itself was never cancelled.
        assert!(!seq.is_cancelled());
        assert!(matches!(seq.pause().await, Err(AthenaError::Disconnected)));
        assert!(matches!(seq.resume().await, Err(AthenaError::Disconnected)));
        assert!(matches!(seq.start().await, Err(AthenaError::Disconnected)));
        assert!(matches!(
            seq.send_named("status").await,
            Err(AthenaError::Disconnected)
        ));
        assert_eq!(rec.commands(), ["v4", "s"]);
        assert_eq!(seq.state(), SequencerState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_named_command_writes_nothing() {
        let rec = Arc::new(Recorder::default());
        let seq = sequencer(&rec, CancellationToken::new());
        assert!(matches!(
            seq.send_named("self-destruct").await,
            Err(AthenaError::UnknownCommand(_))
        ));
        seq.send_named("info").await.unwrap();
        assert_eq!(rec.commands(), ["v1"]);
        assert_eq!(seq.state(), SequencerState::Idle);
    }
}
