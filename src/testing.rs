//! Recording call engine and harness for unit tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BridgeConfig;
use crate::core::line::Lines;
use crate::interfaces::simulated::SimulatedDevice;
use crate::services::call_control::{CallControl, CallLeg, Frame, LegHandle, Signal};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum LegEvent {
    Signal(Signal),
    Frame(Frame),
    Hangup,
}

pub struct RecordingLeg {
    pub name: String,
    pub up: bool,
    pub events: Vec<LegEvent>,
}

impl RecordingLeg {
    pub fn new(name: &str, up: bool) -> Arc<Mutex<RecordingLeg>> {
        Arc::new(Mutex::new(RecordingLeg {
            name: name.to_string(),
            up,
            events: Vec::new(),
        }))
    }

    pub fn hangups(&self) -> usize {
        self.events.iter().filter(|e| **e == LegEvent::Hangup).count()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LegEvent::Signal(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.events
            .iter()
            .filter_map(|e| match e {
                LegEvent::Frame(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }
}

impl CallLeg for RecordingLeg {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&mut self, signal: Signal) {
        self.events.push(LegEvent::Signal(signal));
    }

    fn enqueue_frame(&mut self, frame: Frame) {
        self.events.push(LegEvent::Frame(frame));
    }

    fn request_hangup(&mut self) {
        self.up = false;
        self.events.push(LegEvent::Hangup);
    }

    fn is_up(&self) -> bool {
        self.up
    }
}

/// The recording leg as the handle the ports hold.
pub fn handle(leg: &Arc<Mutex<RecordingLeg>>) -> LegHandle {
    leg.clone()
}

/// Call engine that knows a fixed set of extensions and records every call.
pub struct RecordingControl {
    extensions: Vec<(String, String)>,
    pub legs: Mutex<Vec<Arc<Mutex<RecordingLeg>>>>,
    pub executions: Mutex<Vec<(String, String)>>,
    pub restarts: Mutex<Vec<String>>,
    pub fail_new_leg: AtomicBool,
    pub fail_execution: AtomicBool,
}

impl RecordingControl {
    pub fn new(extensions: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            extensions: extensions
                .iter()
                .map(|(ctx, ext)| (ctx.to_string(), ext.to_string()))
                .collect(),
            legs: Mutex::new(Vec::new()),
            executions: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
            fail_new_leg: AtomicBool::new(false),
            fail_execution: AtomicBool::new(false),
        })
    }

    pub fn leg(&self, index: usize) -> Arc<Mutex<RecordingLeg>> {
        self.legs.lock()[index].clone()
    }

    pub fn leg_count(&self) -> usize {
        self.legs.lock().len()
    }

    pub fn executions(&self) -> Vec<(String, String)> {
        self.executions.lock().clone()
    }
}

impl CallControl for RecordingControl {
    fn extension_exists(&self, context: &str, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|(ctx, ext)| ctx == context && ext == extension)
    }

    fn new_leg(&self, port: usize, extension: &str, context: &str) -> Result<LegHandle> {
        if self.fail_new_leg.load(Ordering::SeqCst) {
            return Err(Error::call_leg("allocation refused"));
        }
        let leg = RecordingLeg::new(&format!("FXS/{}-{}@{}", port + 1, extension, context), true);
        self.legs.lock().push(leg.clone());
        Ok(leg)
    }

    fn start_execution(&self, _leg: &LegHandle, extension: &str, context: &str) -> Result<()> {
        if self.fail_execution.load(Ordering::SeqCst) {
            return Err(Error::call_leg("execution refused"));
        }
        self.executions
            .lock()
            .push((extension.to_string(), context.to_string()));
        Ok(())
    }

    fn restart(&self, reason: &str) {
        self.restarts.lock().push(reason.to_string());
    }
}

pub struct Harness {
    pub lines: Arc<Lines>,
    pub device: Arc<SimulatedDevice>,
    pub control: Arc<RecordingControl>,
}

/// Two idle ports, context `default` knowing extensions 1234 and 9.
pub fn harness() -> Harness {
    harness_with(BridgeConfig::default_config())
}

pub fn harness_with(config: BridgeConfig) -> Harness {
    let device = Arc::new(SimulatedDevice::new(config.interfaces.channels));
    let control = RecordingControl::new(&[("default", "1234"), ("default", "9")]);
    let lines = Lines::new(&config, device.clone(), control.clone())
        .expect("lines must build inside a runtime");
    lines
        .prepare(&config.line)
        .expect("simulated ports come up on hook");
    Harness {
        lines,
        device,
        control,
    }
}
