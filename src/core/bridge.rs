//! Bridge orchestrator
//!
//! Owns the device, the port table and the dispatcher, and brings them up
//! and down in order.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::core::dispatcher::Dispatcher;
use crate::core::line::Lines;
use crate::core::port::PortSnapshot;
use crate::interfaces::device::LineDevice;
use crate::services::call_control::{CallControl, Frame};
use crate::services::dialplan::{EngineEvent, StaticDialplan};
use crate::{Error, Result};

/// Bridge status information
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub channels: usize,
    pub dispatcher_running: bool,
    pub ports: Vec<PortSnapshot>,
}

/// Bridge events
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Started,
    Stopped,
    CallStarted { port: usize, extension: String },
    CallEnded { port: usize },
    RestartRequested { reason: String },
}

pub struct FxsBridge {
    config: BridgeConfig,
    device: Arc<dyn LineDevice>,
    lines: Arc<Lines>,
    dispatcher: Dispatcher,

    event_tx: mpsc::UnboundedSender<BridgeEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<BridgeEvent>>,

    is_running: Arc<RwLock<bool>>,
    start_time: Option<std::time::Instant>,
    tasks: Vec<JoinHandle<()>>,
}

impl FxsBridge {
    pub fn new(
        config: BridgeConfig,
        device: Arc<dyn LineDevice>,
        control: Arc<dyn CallControl>,
    ) -> Result<Self> {
        let lines = Lines::new(&config, device.clone(), control.clone())?;
        let dispatcher = Dispatcher::new(lines.clone(), control);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            device,
            lines,
            dispatcher,
            event_tx,
            event_rx: Some(event_rx),
            is_running: Arc::new(RwLock::new(false)),
            start_time: None,
            tasks: Vec::new(),
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<BridgeEvent>> {
        self.event_rx.take()
    }

    pub fn lines(&self) -> &Arc<Lines> {
        &self.lines
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting FXS bridge on {}", self.config.interfaces.base_path);

        self.device.start()?;

        if let Err(e) = self.lines.prepare(&self.config.line) {
            error!("Port setup failed: {}", e);
            self.cleanup();
            return Err(e);
        }

        if let Err(e) = self.dispatcher.start() {
            self.cleanup();
            return Err(e);
        }

        {
            let mut is_running = self.is_running.write().await;
            *is_running = true;
        }
        self.start_time = Some(std::time::Instant::now());

        let _ = self.event_tx.send(BridgeEvent::Started);
        info!("FXS bridge started with {} ports", self.lines.channels());
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if !self.is_running().await {
            return Ok(());
        }
        info!("Stopping FXS bridge");

        {
            let mut is_running = self.is_running.write().await;
            *is_running = false;
        }

        self.lines.hangup_all();

        if let Err(e) = self.dispatcher.stop().await {
            error!("Error stopping event dispatcher: {}", e);
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.cleanup();

        let _ = self.event_tx.send(BridgeEvent::Stopped);
        info!("FXS bridge stopped");
        Ok(())
    }

    fn cleanup(&self) {
        self.lines.release_ports();
        if let Err(e) = self.device.stop() {
            error!("Error stopping device: {}", e);
        }
    }

    /// Serve calls with the bundled dialplan: dialed calls are answered and
    /// their audio is echoed back to the line.
    pub fn attach_dialplan(&mut self, dialplan: Arc<StaticDialplan>) -> Result<()> {
        let mut engine_rx = dialplan
            .take_event_receiver()
            .ok_or_else(|| Error::internal("Dialplan events already taken"))?;
        let lines = self.lines.clone();
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = engine_rx.recv().await {
                handle_engine_event(&lines, &dialplan, &event_tx, event);
            }
            debug!("Dialplan event channel closed");
        });
        self.tasks.push(task);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn get_status(&self) -> BridgeStatus {
        let uptime = self
            .start_time
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO);

        BridgeStatus {
            running: self.is_running().await,
            uptime_secs: uptime.as_secs(),
            channels: self.lines.channels(),
            dispatcher_running: self.dispatcher.is_running(),
            ports: self.lines.snapshot(),
        }
    }
}

fn handle_engine_event(
    lines: &Lines,
    dialplan: &StaticDialplan,
    event_tx: &mpsc::UnboundedSender<BridgeEvent>,
    event: EngineEvent,
) {
    match event {
        EngineEvent::CallStarted {
            port, extension, ..
        } => {
            if let Err(e) = lines.answer(port, None) {
                warn!("Port {}: answer failed: {}", port, e);
            }
            let _ = event_tx.send(BridgeEvent::CallStarted { port, extension });
        }
        EngineEvent::Frame { port, frame, .. } => match frame {
            Frame::Voice(_) => {
                if let Err(e) = lines.write_frame(port, &frame) {
                    debug!("Port {}: echo failed: {}", port, e);
                }
            }
            Frame::Dtmf(digit) => info!("Port {} sent digit '{}'", port, digit),
        },
        EngineEvent::Signal { port, signal, .. } => {
            debug!("Port {} signalled {:?}", port, signal);
        }
        EngineEvent::HangupRequested { leg_id, port } => {
            let Some(leg) = dialplan.leg(&leg_id) else {
                debug!("Port {}: hangup for unknown leg {}", port, leg_id);
                return;
            };
            if let Err(e) = lines.hangup(port, &leg) {
                warn!("Port {}: hangup failed: {}", port, e);
            }
            dialplan.release(&leg_id);
            let _ = event_tx.send(BridgeEvent::CallEnded { port });
        }
        EngineEvent::RestartRequested { reason } => {
            let _ = event_tx.send(BridgeEvent::RestartRequested { reason });
        }
    }
}

impl Drop for FxsBridge {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
