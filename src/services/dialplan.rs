//! Static regex dialplan
//!
//! A small call engine for running the bridge standalone: extensions are
//! matched against per-context regex rules, matched calls are answered and
//! everything that happens to a leg is reported on an event channel.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::DialplanConfig;
use crate::services::call_control::{CallControl, CallLeg, Frame, LegHandle, Signal};
use crate::{Error, Result};

/// Engine side events
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CallStarted {
        leg_id: Uuid,
        port: usize,
        extension: String,
        context: String,
    },
    Signal {
        leg_id: Uuid,
        port: usize,
        signal: Signal,
    },
    Frame {
        leg_id: Uuid,
        port: usize,
        frame: Frame,
    },
    HangupRequested {
        leg_id: Uuid,
        port: usize,
    },
    RestartRequested {
        reason: String,
    },
}

struct DialplanRule {
    context: String,
    pattern: Regex,
}

/// Leg created by the static engine.
pub struct EngineLeg {
    id: Uuid,
    name: String,
    port: usize,
    up: bool,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl CallLeg for EngineLeg {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&mut self, signal: Signal) {
        if signal == Signal::Answered {
            self.up = true;
        }
        let _ = self.event_tx.send(EngineEvent::Signal {
            leg_id: self.id,
            port: self.port,
            signal,
        });
    }

    fn enqueue_frame(&mut self, frame: Frame) {
        let _ = self.event_tx.send(EngineEvent::Frame {
            leg_id: self.id,
            port: self.port,
            frame,
        });
    }

    fn request_hangup(&mut self) {
        self.up = false;
        let _ = self.event_tx.send(EngineEvent::HangupRequested {
            leg_id: self.id,
            port: self.port,
        });
    }

    fn is_up(&self) -> bool {
        self.up
    }
}

pub struct StaticDialplan {
    rules: Vec<DialplanRule>,
    legs: Arc<DashMap<Uuid, Arc<Mutex<EngineLeg>>>>,
    event_tx: mpsc::UnboundedSender<EngineEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl StaticDialplan {
    pub fn new(config: &DialplanConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(|rule| {
                let pattern = Regex::new(&rule.pattern).map_err(|e| {
                    Error::parse(format!("Invalid dialplan pattern '{}': {}", rule.pattern, e))
                })?;
                Ok(DialplanRule {
                    context: rule.context.clone(),
                    pattern,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!("Dialplan loaded with {} rules", rules.len());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            rules,
            legs: Arc::new(DashMap::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.event_rx.lock().take()
    }

    /// Create a leg for a call toward `port`, as a remote caller would.
    pub fn incoming_leg(&self, port: usize) -> LegHandle {
        self.register(port, format!("FXS/{}-in", port + 1), false)
    }

    pub fn leg(&self, leg_id: &Uuid) -> Option<LegHandle> {
        self.legs.get(leg_id).map(|leg| {
            let handle: LegHandle = leg.value().clone();
            handle
        })
    }

    /// Forget a leg once its port has let go of it.
    pub fn release(&self, leg_id: &Uuid) {
        if self.legs.remove(leg_id).is_some() {
            debug!("Released leg {}", leg_id);
        }
    }

    pub fn active_legs(&self) -> usize {
        self.legs.len()
    }

    fn register(&self, port: usize, name: String, up: bool) -> LegHandle {
        let id = Uuid::new_v4();
        let leg = Arc::new(Mutex::new(EngineLeg {
            id,
            name,
            port,
            up,
            event_tx: self.event_tx.clone(),
        }));
        self.legs.insert(id, leg.clone());
        leg
    }

    fn find(&self, handle: &LegHandle) -> Option<Arc<Mutex<EngineLeg>>> {
        self.legs
            .iter()
            .find(|entry| {
                std::ptr::eq(
                    Arc::as_ptr(entry.value()) as *const u8,
                    Arc::as_ptr(handle) as *const u8,
                )
            })
            .map(|entry| entry.value().clone())
    }
}

impl CallControl for StaticDialplan {
    fn extension_exists(&self, context: &str, extension: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.context == context && rule.pattern.is_match(extension))
    }

    fn new_leg(&self, port: usize, extension: &str, context: &str) -> Result<LegHandle> {
        let leg = self.register(port, format!("FXS/{}-{}@{}", port + 1, extension, context), false);
        debug!("Allocated leg for {}@{} on port {}", extension, context, port);
        Ok(leg)
    }

    fn start_execution(&self, leg: &LegHandle, extension: &str, context: &str) -> Result<()> {
        let leg = self
            .find(leg)
            .ok_or_else(|| Error::call_leg("leg not allocated by this dialplan"))?;

        let (leg_id, port) = {
            let mut leg = leg.lock();
            leg.up = true;
            (leg.id, leg.port)
        };

        info!("Executing {}@{} for port {}", extension, context, port);
        self.event_tx
            .send(EngineEvent::CallStarted {
                leg_id,
                port,
                extension: extension.to_string(),
                context: context.to_string(),
            })
            .map_err(|_| Error::call_leg("engine event channel closed"))
    }

    fn restart(&self, reason: &str) {
        error!("Restart requested: {}", reason);
        let _ = self.event_tx.send(EngineEvent::RestartRequested {
            reason: reason.to_string(),
        });
    }
}
