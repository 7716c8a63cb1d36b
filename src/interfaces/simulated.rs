//! In-memory line device
//!
//! Behaves like the voice-processing device as far as the bridge can tell:
//! events and inbound media are injected per port, and everything the bridge
//! does to a line (tones, ringing, line feed, coder setup, media writes) is
//! recorded so it can be inspected.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::config::LineConfig;
use crate::interfaces::device::{
    CallerId, HardwareEvent, HardwareEventKind, HookStatus, JitterStats, LineDevice, LineFeed,
    Readiness, Tone,
};
use crate::protocols::codec::{CodecParams, CoderType};
use crate::{Error, Result};

/// Recorded state of one simulated line.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedLine {
    pub hook: HookStatus,
    pub tone: Tone,
    pub line_feed: LineFeed,
    pub ringing: bool,
    pub caller_id: Option<CallerId>,
    pub encoder: Option<CodecParams>,
    pub coders_running: bool,
    pub configured: bool,
    pub payload_table: Vec<(CoderType, u8)>,
    pub jitter: JitterStats,
    pub written: Vec<Bytes>,
}

impl SimulatedLine {
    fn new() -> Self {
        Self {
            hook: HookStatus::OnHook,
            tone: Tone::None,
            line_feed: LineFeed::Standby,
            ringing: false,
            caller_id: None,
            encoder: None,
            coders_running: false,
            configured: false,
            payload_table: Vec::new(),
            jitter: JitterStats::default(),
            written: Vec::new(),
        }
    }
}

struct SimState {
    running: bool,
    woken: bool,
    lines: Vec<SimulatedLine>,
    events: Vec<VecDeque<HardwareEventKind>>,
    media: Vec<VecDeque<Bytes>>,
    failures: HashSet<(usize, &'static str)>,
    write_limit: Option<usize>,
    wait_failing: bool,
    waits: usize,
}

pub struct SimulatedDevice {
    channels: usize,
    state: Mutex<SimState>,
    ready: Condvar,
}

impl SimulatedDevice {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            state: Mutex::new(SimState {
                running: false,
                woken: false,
                lines: (0..channels).map(|_| SimulatedLine::new()).collect(),
                events: (0..channels).map(|_| VecDeque::new()).collect(),
                media: (0..channels).map(|_| VecDeque::new()).collect(),
                failures: HashSet::new(),
                write_limit: None,
                wait_failing: false,
                waits: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Queue a hardware event. Hook events also update the reported hook status.
    pub fn inject_event(&self, port: usize, kind: HardwareEventKind) {
        let mut state = self.state.lock();
        match kind {
            HardwareEventKind::HookOff => state.lines[port].hook = HookStatus::OffHook,
            HardwareEventKind::HookOn => state.lines[port].hook = HookStatus::OnHook,
            _ => {}
        }
        state.events[port].push_back(kind);
        self.ready.notify_all();
    }

    /// Queue one inbound media transport unit.
    pub fn inject_media(&self, port: usize, unit: Bytes) {
        let mut state = self.state.lock();
        state.media[port].push_back(unit);
        self.ready.notify_all();
    }

    pub fn set_hook_status(&self, port: usize, hook: HookStatus) {
        self.state.lock().lines[port].hook = hook;
    }

    pub fn set_jitter_stats(&self, port: usize, stats: JitterStats) {
        self.state.lock().lines[port].jitter = stats;
    }

    /// Make `operation` fail on `port` until cleared.
    pub fn fail_operation(&self, port: usize, operation: &'static str) {
        self.state.lock().failures.insert((port, operation));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make every device wait fail at once.
    pub fn fail_wait(&self, failing: bool) {
        self.state.lock().wait_failing = failing;
    }

    /// Number of device waits so far.
    pub fn wait_count(&self) -> usize {
        self.state.lock().waits
    }

    /// Accept at most `limit` bytes per media write.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.lock().write_limit = limit;
    }

    pub fn line(&self, port: usize) -> SimulatedLine {
        self.state.lock().lines[port].clone()
    }

    pub fn take_written(&self, port: usize) -> Vec<Bytes> {
        std::mem::take(&mut self.state.lock().lines[port].written)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn with_line<T>(
        &self,
        port: usize,
        operation: &'static str,
        f: impl FnOnce(&mut SimulatedLine) -> T,
    ) -> Result<T> {
        let mut state = self.state.lock();
        if port >= self.channels {
            return Err(Error::hardware(Some(port), operation, "no such channel"));
        }
        if state.failures.contains(&(port, operation)) {
            return Err(Error::hardware(Some(port), operation, "injected failure"));
        }
        Ok(f(&mut state.lines[port]))
    }

    fn readiness(state: &SimState) -> Readiness {
        Readiness {
            events: state.events.iter().any(|q| !q.is_empty()),
            media: state
                .media
                .iter()
                .enumerate()
                .filter(|(_, q)| !q.is_empty())
                .map(|(port, _)| port)
                .collect(),
        }
    }
}

impl LineDevice for SimulatedDevice {
    fn channels(&self) -> usize {
        self.channels
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        info!("Simulated device started with {} channels", self.channels);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = false;
        info!("Simulated device stopped");
        Ok(())
    }

    fn configure_port(&self, port: usize, _line: &LineConfig) -> Result<()> {
        self.with_line(port, "configure", |line| {
            line.configured = true;
            line.line_feed = LineFeed::Standby;
        })
    }

    fn set_payload_table(&self, port: usize, table: &[(CoderType, u8)]) -> Result<()> {
        self.with_line(port, "payload table", |line| {
            line.payload_table = table.to_vec();
        })
    }

    fn hook_status(&self, port: usize) -> Result<HookStatus> {
        self.with_line(port, "hook status", |line| line.hook)
    }

    fn wait(&self, timeout: Duration) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waits += 1;
        if state.wait_failing {
            return Err(Error::hardware(None, "wait", "injected failure"));
        }
        loop {
            if state.woken {
                state.woken = false;
                return Ok(Self::readiness(&state));
            }
            let readiness = Self::readiness(&state);
            if !readiness.is_idle() {
                return Ok(readiness);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return Ok(Readiness::default());
            }
        }
    }

    fn wake(&self) {
        let mut state = self.state.lock();
        state.woken = true;
        self.ready.notify_all();
    }

    fn next_event(&self, port: usize) -> Result<Option<HardwareEvent>> {
        let mut state = self.state.lock();
        let queue = state
            .events
            .get_mut(port)
            .ok_or_else(|| Error::hardware(Some(port), "event get", "no such channel"))?;
        Ok(queue.pop_front().map(|kind| HardwareEvent { port, kind }))
    }

    fn read_media(&self, port: usize, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.failures.contains(&(port, "read")) {
            return Err(Error::hardware(Some(port), "read", "injected failure"));
        }
        match state.media.get_mut(port).and_then(|q| q.pop_front()) {
            Some(unit) => {
                let len = unit.len().min(buf.len());
                buf[..len].copy_from_slice(&unit[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }

    fn write_media(&self, port: usize, data: &[u8]) -> Result<usize> {
        let limit = self.state.lock().write_limit;
        self.with_line(port, "write", |line| {
            let len = limit.map_or(data.len(), |l| data.len().min(l));
            line.written.push(Bytes::copy_from_slice(&data[..len]));
            len
        })
    }

    fn play_tone(&self, port: usize, tone: Tone) -> Result<()> {
        debug!("Simulated port {} tone {:?}", port, tone);
        self.with_line(port, "tone", |line| line.tone = tone)
    }

    fn ring_start(&self, port: usize, caller_id: Option<&CallerId>) -> Result<()> {
        self.with_line(port, "ring start", |line| {
            line.ringing = true;
            line.caller_id = caller_id.cloned();
        })
    }

    fn ring_stop(&self, port: usize) -> Result<()> {
        self.with_line(port, "ring stop", |line| line.ringing = false)
    }

    fn set_line_feed(&self, port: usize, feed: LineFeed) -> Result<()> {
        self.with_line(port, "line feed", |line| line.line_feed = feed)
    }

    fn configure_encoder(&self, port: usize, params: CodecParams) -> Result<()> {
        self.with_line(port, "encoder config", |line| line.encoder = Some(params))
    }

    fn start_coders(&self, port: usize) -> Result<()> {
        self.with_line(port, "coder start", |line| line.coders_running = true)
    }

    fn stop_coders(&self, port: usize) -> Result<()> {
        self.with_line(port, "coder stop", |line| line.coders_running = false)
    }

    fn jitter_stats(&self, port: usize) -> Result<JitterStats> {
        self.with_line(port, "jitter stats", |line| line.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_events_are_per_port_fifo() {
        let device = SimulatedDevice::new(2);
        device.inject_event(1, HardwareEventKind::HookOff);
        device.inject_event(1, HardwareEventKind::DtmfDigit('5'));

        assert_eq!(device.next_event(0).unwrap(), None);
        assert_eq!(
            device.next_event(1).unwrap().map(|e| e.kind),
            Some(HardwareEventKind::HookOff)
        );
        assert_eq!(
            device.next_event(1).unwrap().map(|e| e.kind),
            Some(HardwareEventKind::DtmfDigit('5'))
        );
        assert_eq!(device.next_event(1).unwrap(), None);
        assert_eq!(device.hook_status(1).unwrap(), HookStatus::OffHook);
    }

    #[test]
    fn test_wait_reports_readiness() {
        let device = SimulatedDevice::new(3);
        assert!(device.wait(Duration::from_millis(10)).unwrap().is_idle());

        device.inject_media(2, Bytes::from_static(b"x"));
        let readiness = device.wait(Duration::from_millis(10)).unwrap();
        assert!(!readiness.events);
        assert_eq!(readiness.media, vec![2]);
    }

    #[test]
    fn test_wake_interrupts_wait() {
        let device = Arc::new(SimulatedDevice::new(1));
        let waiter = {
            let device = device.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                device.wait(Duration::from_secs(30)).unwrap();
                started.elapsed()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        device.wake();
        let elapsed = waiter.join().unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_injected_failure_and_short_write() {
        let device = SimulatedDevice::new(1);
        device.fail_operation(0, "line feed");
        assert!(device.set_line_feed(0, LineFeed::Active).is_err());
        device.clear_failures();
        assert!(device.set_line_feed(0, LineFeed::Active).is_ok());

        device.fail_wait(true);
        assert!(device.wait(Duration::from_secs(30)).is_err());
        assert_eq!(device.wait_count(), 1);

        device.set_write_limit(Some(4));
        assert_eq!(device.write_media(0, b"abcdefgh").unwrap(), 4);
        assert_eq!(device.take_written(0), vec![Bytes::from_static(b"abcd")]);
    }
}
