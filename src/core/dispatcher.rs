//! Hardware event dispatcher
//!
//! One blocking task waits on the device and feeds hook and digit events to
//! the line state machine, then pulls media from every port that has some.
//! It is the only writer of hardware driven transitions.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::core::line::Lines;
use crate::interfaces::device::{HardwareEvent, HardwareEventKind};
use crate::services::call_control::CallControl;
use crate::{Error, Result};

/// Upper bound on a single wait; only used to stay live.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Pause after a failed wait before polling the device again.
const WAIT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    thread: Arc<Mutex<Option<ThreadId>>>,
}

pub struct Dispatcher {
    lines: Arc<Lines>,
    control: Arc<dyn CallControl>,
    running: Mutex<Option<Running>>,
}

impl Dispatcher {
    pub fn new(lines: Arc<Lines>, control: Arc<dyn CallControl>) -> Self {
        Self {
            lines,
            control,
            running: Mutex::new(None),
        }
    }

    /// Start the dispatcher, or wake it if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();

        if let Some(current) = running.as_ref() {
            let on_dispatcher = *current.thread.lock() == Some(std::thread::current().id());
            if on_dispatcher {
                warn!("Cannot restart the event dispatcher from itself");
                return Err(Error::dispatcher("restart requested by the dispatcher itself"));
            }
            if !current.handle.is_finished() {
                debug!("Event dispatcher already running, waking it");
                self.lines.device().wake();
                return Ok(());
            }
        }

        let runtime = Handle::try_current()
            .map_err(|e| Error::dispatcher(format!("No tokio runtime: {}", e)))?;

        let cancel = CancellationToken::new();
        let thread = Arc::new(Mutex::new(None));

        let handle = {
            let lines = self.lines.clone();
            let control = self.control.clone();
            let cancel = cancel.clone();
            let thread = thread.clone();
            runtime.spawn_blocking(move || run(lines, control, cancel, thread))
        };

        *running = Some(Running {
            cancel,
            handle,
            thread,
        });
        info!("Event dispatcher started");
        Ok(())
    }

    /// Cancel the dispatcher, wake it from its wait and wait for it to exit.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };

        running.cancel.cancel();
        self.lines.device().wake();

        running
            .handle
            .await
            .map_err(|e| Error::dispatcher(format!("Dispatcher task failed: {}", e)))?;
        info!("Event dispatcher stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            self.lines.device().wake();
        }
    }
}

fn run(
    lines: Arc<Lines>,
    control: Arc<dyn CallControl>,
    cancel: CancellationToken,
    thread: Arc<Mutex<Option<ThreadId>>>,
) {
    *thread.lock() = Some(std::thread::current().id());
    debug!("Event dispatcher thread running");

    let device = lines.device().clone();
    while !cancel.is_cancelled() {
        let readiness = match device.wait(POLL_TIMEOUT) {
            Ok(readiness) => readiness,
            Err(e) => {
                error!("Device wait failed: {}", e);
                std::thread::sleep(WAIT_RETRY_DELAY);
                continue;
            }
        };

        if cancel.is_cancelled() {
            break;
        }

        if readiness.events {
            match drain_events(&lines) {
                Err(e) if e.is_fatal() => {
                    error!("{}, restarting", e);
                    control.restart(&e.to_string());
                    break;
                }
                Err(e) => error!("Event handling failed: {}", e),
                Ok(()) => {}
            }
        }

        for port in readiness.media {
            lines.read_media(port);
        }
    }

    *thread.lock() = None;
    debug!("Event dispatcher thread exiting");
}

/// Fetch at most one pending event per port.
fn drain_events(lines: &Lines) -> Result<()> {
    for port in 0..lines.channels() {
        match lines.device().next_event(port) {
            Ok(Some(event)) => dispatch_event(lines, event)?,
            Ok(None) => {}
            Err(e) => debug!("Port {}: event fetch failed: {}", port, e),
        }
    }
    Ok(())
}

/// Route one hardware event. Only unrecognized events are returned as errors.
pub fn dispatch_event(lines: &Lines, event: HardwareEvent) -> Result<()> {
    let port = event.port;
    let result = match event.kind {
        HardwareEventKind::HookOn => lines.hook_on(port),
        HardwareEventKind::HookOff => lines.hook_off(port),
        HardwareEventKind::DtmfDigit(_) | HardwareEventKind::PulseDigit(_) => {
            match event.kind.digit() {
                Some(digit) => lines.digit(port, digit),
                None => {
                    warn!("Port {}: invalid digit event {:?}", port, event.kind);
                    Ok(())
                }
            }
        }
        HardwareEventKind::CodecChange
        | HardwareEventKind::ToneEnd
        | HardwareEventKind::CallerIdEnd => {
            trace!("Port {}: ignoring {:?}", port, event.kind);
            Ok(())
        }
        HardwareEventKind::Other(code) => return Err(Error::FatalEvent { port, code }),
    };

    if let Err(e) = result {
        error!("Port {}: handling {:?} failed: {}", port, event.kind, e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::port::LineState;
    use crate::protocols::rtp::RtpPacket;
    use crate::services::call_control::Frame;
    use crate::testing::harness;
    use bytes::Bytes;
    use std::time::Instant;

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_dispatch_call_from_events() {
        let h = harness();
        let dispatcher = Dispatcher::new(h.lines.clone(), h.control.clone());
        dispatcher.start().unwrap();
        assert!(dispatcher.is_running());

        h.device.inject_event(0, HardwareEventKind::HookOff);
        for d in ['1', '2', '3', '4', '#'] {
            h.device.inject_event(0, HardwareEventKind::DtmfDigit(d));
        }

        assert!(eventually(|| h.lines.state(0) == Some(LineState::InCall)).await);
        assert_eq!(
            h.control.executions(),
            vec![("1234".to_string(), "default".to_string())]
        );

        let unit = RtpPacket::new(8, 1, 0, Bytes::from(vec![0x55; 160])).encode();
        h.device.inject_media(0, unit);
        let leg = h.control.leg(0);
        assert!(eventually(|| leg.lock().frames().len() == 1).await);
        assert!(matches!(leg.lock().frames()[0], Frame::Voice(_)));

        h.device.inject_event(0, HardwareEventKind::HookOn);
        assert!(eventually(|| h.lines.state(0) == Some(LineState::OnHook)).await);
        assert_eq!(leg.lock().hangups(), 1);

        dispatcher.stop().await.unwrap();
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn test_ignored_events() {
        let h = harness();
        for kind in [
            HardwareEventKind::CodecChange,
            HardwareEventKind::ToneEnd,
            HardwareEventKind::CallerIdEnd,
        ] {
            dispatch_event(&h.lines, HardwareEvent { port: 0, kind }).unwrap();
        }
        assert_eq!(h.lines.state(0), Some(LineState::OnHook));
    }

    #[tokio::test]
    async fn test_unknown_event_is_fatal() {
        let h = harness();
        let result = dispatch_event(
            &h.lines,
            HardwareEvent {
                port: 1,
                kind: HardwareEventKind::Other(0x1234),
            },
        );
        assert!(matches!(result, Err(Error::FatalEvent { port: 1, code: 0x1234 })));
    }

    #[tokio::test]
    async fn test_fatal_event_requests_restart_and_stops() {
        let h = harness();
        let dispatcher = Dispatcher::new(h.lines.clone(), h.control.clone());
        dispatcher.start().unwrap();

        h.device.inject_event(1, HardwareEventKind::Other(0xdead));
        assert!(eventually(|| !h.control.restarts.lock().is_empty()).await);
        assert!(eventually(|| !dispatcher.is_running()).await);

        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let h = harness();
        h.device.fail_operation(0, "line feed");
        let dispatcher = Dispatcher::new(h.lines.clone(), h.control.clone());
        dispatcher.start().unwrap();

        h.device.inject_event(0, HardwareEventKind::HookOff);
        h.device.inject_event(1, HardwareEventKind::HookOff);
        assert!(eventually(|| h.lines.state(1) == Some(LineState::OffHook)).await);
        assert_eq!(h.lines.state(0), Some(LineState::OnHook));
        assert!(dispatcher.is_running());

        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_device_wait_is_throttled() {
        let h = harness();
        h.device.fail_wait(true);
        let dispatcher = Dispatcher::new(h.lines.clone(), h.control.clone());
        dispatcher.start().unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.device.wait_count() <= 10);
        assert!(dispatcher.is_running());
        assert!(h.control.restarts.lock().is_empty());

        let started = Instant::now();
        dispatcher.stop().await.unwrap();
        assert!(started.elapsed() < POLL_TIMEOUT);
    }

    #[tokio::test]
    async fn test_start_twice_and_prompt_stop() {
        let h = harness();
        let dispatcher = Dispatcher::new(h.lines.clone(), h.control.clone());
        dispatcher.start().unwrap();
        dispatcher.start().unwrap();
        assert!(dispatcher.is_running());

        let started = Instant::now();
        dispatcher.stop().await.unwrap();
        assert!(started.elapsed() < POLL_TIMEOUT);

        // stopping again is a no-op, starting again works
        dispatcher.stop().await.unwrap();
        dispatcher.start().unwrap();
        assert!(dispatcher.is_running());
        dispatcher.stop().await.unwrap();
    }
}
