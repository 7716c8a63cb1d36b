//! Line state machine of the FXS ports
//!
//! All port state lives in one table behind a single lock. The lock is
//! leaf-level: nothing that can call back into the ports (leg signals,
//! frames, hangup requests, call execution) runs while it is held. Those
//! calls are collected as `Outbound` effects and performed after unlocking.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{BridgeConfig, InterfacesConfig, LineConfig};
use crate::core::port::{CallTimes, LineState, Port, PortSnapshot};
use crate::interfaces::device::{CallerId, HookStatus, LineDevice, LineFeed, Tone};
use crate::protocols::codec::{payload_type_table, Codec};
use crate::protocols::rtp::{Inbound, RTP_BUFFER_LEN};
use crate::services::call_control::{
    same_leg, CallControl, DeviceState, Frame, Indication, LegHandle, Signal,
};
use crate::{Error, Result};

/// Leg interactions deferred until the port table is unlocked.
enum Outbound {
    Signal(LegHandle, Signal),
    Frame(LegHandle, Frame),
    Hangup(LegHandle),
    Execute {
        port: usize,
        leg: LegHandle,
        extension: String,
        context: String,
    },
}

pub struct Lines {
    ports: Mutex<Vec<Port>>,
    device: Arc<dyn LineDevice>,
    control: Arc<dyn CallControl>,
    runtime: Handle,
    interfaces: InterfacesConfig,
    interdigit: Duration,
    terminator: char,
    this: Weak<Lines>,
}

impl Lines {
    /// Build the port table. Must be called from within a tokio runtime,
    /// which is used for the inter-digit timers.
    pub fn new(
        config: &BridgeConfig,
        device: Arc<dyn LineDevice>,
        control: Arc<dyn CallControl>,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::internal(format!("No tokio runtime for dial timers: {}", e)))?;

        let channels = device.channels();
        if channels != config.interfaces.channels {
            warn!(
                "Configured for {} channels but device has {}, using {}",
                config.interfaces.channels, channels, channels
            );
        }

        let codec = config.media.codec;
        let max_extension_length = config.dialing.max_extension_length;
        let ports = (0..channels)
            .map(|id| Port::new(id, codec, max_extension_length))
            .collect();

        Ok(Arc::new_cyclic(|this| Self {
            ports: Mutex::new(ports),
            device,
            control,
            runtime,
            interfaces: config.interfaces.clone(),
            interdigit: config.dialing.interdigit_timeout(),
            terminator: config.dialing.terminator,
            this: this.clone(),
        }))
    }

    pub fn channels(&self) -> usize {
        self.device.channels()
    }

    pub fn device(&self) -> &Arc<dyn LineDevice> {
        &self.device
    }

    /// Configure every port and read its initial hook state.
    ///
    /// A port whose hook state cannot be determined aborts startup.
    pub fn prepare(&self, line: &LineConfig) -> Result<()> {
        let table = payload_type_table();
        let mut ports = self.ports.lock();

        for port in ports.iter_mut() {
            let id = port.id;
            self.device.configure_port(id, line)?;
            self.device.set_payload_table(id, &table)?;

            port.state = match self.device.hook_status(id)? {
                HookStatus::OnHook => LineState::OnHook,
                HookStatus::OffHook => LineState::OffHook,
                HookStatus::Unknown => {
                    error!("Port {}: unable to determine hook status", id);
                    port.state = LineState::Unknown;
                    return Err(Error::hardware(Some(id), "hook status", "unknown hook state"));
                }
            };
            debug!("Port {} is {}", id, port.state);
        }

        info!("{} FXS ports configured", ports.len());
        Ok(())
    }

    /// Put every port back in standby before the device goes down.
    pub fn release_ports(&self) {
        let mut ports = self.ports.lock();
        for port in ports.iter_mut() {
            port.digits.cancel_timer();
            port.digits.reset();
            self.standby(port.id);
        }
    }

    /// Ask the engine to hang up every call still owned by a port.
    pub fn hangup_all(&self) {
        let owners: Vec<LegHandle> = self
            .ports
            .lock()
            .iter()
            .filter_map(|p| p.owner.clone())
            .collect();

        if !owners.is_empty() {
            info!("Requesting hangup of {} active calls", owners.len());
        }
        self.perform(owners.into_iter().map(Outbound::Hangup).collect());
    }

    pub fn state(&self, port: usize) -> Option<LineState> {
        self.ports.lock().get(port).map(|p| p.state)
    }

    pub fn snapshot(&self) -> Vec<PortSnapshot> {
        self.ports.lock().iter().map(Port::snapshot).collect()
    }

    // Hardware driven transitions

    /// Handset went on hook.
    pub fn hook_on(&self, port: usize) -> Result<()> {
        let mut effects = Vec::new();
        {
            let mut ports = self.ports.lock();
            let p = Self::port_mut(&mut ports, port)?;
            debug!("Port {} detected on hook in state {}", port, p.state);

            match p.state {
                LineState::Dialing | LineState::OffHook => self.end_dialing(p, &mut effects),
                LineState::InCall => self.end_call(p, &mut effects),
                LineState::Ringing => {
                    if let Err(e) = self.device.ring_stop(port) {
                        error!("Port {}: failed to stop ringing: {}", port, e);
                    }
                    self.end_call(p, &mut effects);
                }
                _ => {}
            }

            p.state = LineState::OnHook;
            self.standby(port);
        }
        self.perform(effects);
        Ok(())
    }

    /// Handset went off hook: answer a ringing call or present dial tone.
    pub fn hook_off(&self, port: usize) -> Result<()> {
        let mut effects = Vec::new();
        {
            let mut ports = self.ports.lock();
            let p = Self::port_mut(&mut ports, port)?;
            debug!("Port {} detected off hook in state {}", port, p.state);

            if let Err(e) = self.device.set_line_feed(port, LineFeed::Active) {
                error!("Port {}: failed to activate line feed: {}", port, e);
                return Err(e);
            }

            match (p.state, p.owner.clone()) {
                (LineState::Ringing, Some(owner)) => self.accept_call(p, owner, &mut effects),
                (state, _) => {
                    if state == LineState::Ringing {
                        warn!("Port {} answered a ring without a call", port);
                    }
                    p.state = LineState::OffHook;
                    self.tone(port, Tone::Dial);
                }
            }
        }
        self.perform(effects);
        Ok(())
    }

    /// A DTMF or pulse digit was detected.
    pub fn digit(&self, port: usize, digit: char) -> Result<()> {
        let mut effects = Vec::new();
        {
            let mut ports = self.ports.lock();
            let p = Self::port_mut(&mut ports, port)?;
            debug!("Port {} detected digit '{}'", port, digit);

            match p.state {
                LineState::InCall => match &p.owner {
                    Some(owner) => {
                        debug!("Port {} transmitting digit '{}'", port, digit);
                        effects.push(Outbound::Frame(owner.clone(), Frame::Dtmf(digit)));
                    }
                    None => debug!("Port {} digit without owner", port),
                },
                LineState::OffHook | LineState::Dialing => {
                    if p.state == LineState::OffHook {
                        p.state = LineState::Dialing;
                        self.tone(port, Tone::None);
                    }

                    if digit == self.terminator {
                        p.digits.cancel_timer();
                        self.dial(p, &mut effects);
                    } else if p.digits.push(digit) {
                        self.arm_dial_timer(p);
                    } else {
                        warn!("Port {}: no room for another digit", port);
                        self.end_dialing(p, &mut effects);
                        self.tone(port, Tone::Busy);
                        p.state = LineState::CallEnded;
                    }
                }
                state => error!("Port {}: digit '{}' in unhandled state {}", port, digit, state),
            }
        }
        self.perform(effects);
        Ok(())
    }

    /// Inter-digit timeout. Stale or superseded timers are ignored.
    pub fn dial_timeout(&self, port: usize, generation: u64) {
        let mut effects = Vec::new();
        {
            let mut ports = self.ports.lock();
            let Some(p) = ports.get_mut(port) else {
                return;
            };

            if !p.digits.fire(generation) {
                trace!("Port {}: stale dial timer {}", port, generation);
                return;
            }
            if p.state != LineState::Dialing {
                debug!("Port {}: dial timeout in state {}", port, p.state);
                return;
            }

            debug!("Port {}: inter-digit timeout", port);
            self.dial(p, &mut effects);
        }
        self.perform(effects);
    }

    // Call control entry points

    /// Ring a port for a call from the engine.
    ///
    /// `destination` is the 1-based port number. A port that is not idle is
    /// left alone and the leg is told the line is busy.
    pub fn originate(
        &self,
        destination: &str,
        leg: LegHandle,
        codec: Codec,
        caller_id: Option<CallerId>,
    ) -> Result<usize> {
        let port = self.parse_destination(destination)?;
        let mut effects = Vec::new();

        let result = {
            let mut ports = self.ports.lock();
            let p = Self::port_mut(&mut ports, port)?;

            if p.state != LineState::OnHook {
                debug!("Port {} already in use ({})", port, p.state);
                effects.push(Outbound::Signal(leg, Signal::Busy));
                Err(Error::PortBusy(port))
            } else {
                debug!(
                    "Port {} ringing, caller id {:?} <{:?}>",
                    port,
                    caller_id.as_ref().and_then(|c| c.number.as_deref()),
                    caller_id.as_ref().and_then(|c| c.name.as_deref())
                );
                match self.device.ring_start(port, caller_id.as_ref()) {
                    Ok(()) => {
                        p.owner = Some(leg.clone());
                        p.media.renegotiate(codec);
                        p.times = CallTimes::default();
                        p.state = LineState::Ringing;
                        effects.push(Outbound::Signal(leg, Signal::Ringing));
                        Ok(port)
                    }
                    Err(e) => {
                        error!("Port {}: failed to start ringing: {}", port, e);
                        Err(e)
                    }
                }
            }
        };

        self.perform(effects);
        result
    }

    /// The engine answered a call dialed from this port.
    pub fn answer(&self, port: usize, codec: Option<Codec>) -> Result<()> {
        let mut ports = self.ports.lock();
        let p = Self::port_mut(&mut ports, port)?;
        debug!("Port {}: remote end answered", port);

        let codec = codec.unwrap_or(p.media.codec);
        self.configure_media(p, codec);
        p.times.answer = Some(Utc::now());
        Ok(())
    }

    /// The engine is done with `leg` on this port.
    ///
    /// Confirmations arrive asynchronously, so a hangup for a leg the port no
    /// longer owns is ignored; only an unowned idle or ringing port accepts
    /// it without a match.
    pub fn hangup(&self, port: usize, leg: &LegHandle) -> Result<()> {
        let mut ports = self.ports.lock();
        let p = Self::port_mut(&mut ports, port)?;

        let applies = match &p.owner {
            Some(owner) => same_leg(owner, leg),
            None => matches!(p.state, LineState::Ringing | LineState::OnHook),
        };
        if !applies {
            trace!("Port {}: ignoring hangup for a leg it does not own", port);
            return Ok(());
        }
        debug!("Port {}: hangup in state {}", port, p.state);

        match p.state {
            LineState::Ringing | LineState::OnHook => {
                if let Err(e) = self.device.ring_stop(port) {
                    error!("Port {}: failed to stop ringing: {}", port, e);
                }
                p.state = LineState::OnHook;
            }
            _ => {
                debug!("Port {}: we were hung up, playing busy tone", port);
                p.state = LineState::CallEnded;
                self.tone(port, Tone::Busy);
            }
        }

        self.update_jitter(p);
        p.owner = None;
        Ok(())
    }

    /// The engine moved the call to another leg object. Nothing to do.
    pub fn fixup(&self, port: usize) -> Result<()> {
        let mut ports = self.ports.lock();
        Self::port_mut(&mut ports, port)?;
        trace!("Port {}: fixup", port);
        Ok(())
    }

    /// Present an indication on the line. Returns false for indications the
    /// engine has to generate itself.
    pub fn indicate(&self, port: usize, indication: Indication) -> Result<bool> {
        let mut ports = self.ports.lock();
        let p = Self::port_mut(&mut ports, port)?;
        debug!("Port {}: indication {:?}", port, indication);

        let handled = match indication {
            Indication::StopTone => {
                self.tone(port, Tone::None);
                true
            }
            Indication::Busy | Indication::Congestion => {
                self.tone(port, Tone::Busy);
                true
            }
            Indication::Ringing | Indication::Progress => {
                p.times.setup_delay = p.times.setup_start.map(|start| start.elapsed());
                self.tone(port, Tone::Ringback);
                true
            }
            _ => false,
        };
        Ok(handled)
    }

    /// Read a line attribute by name, case-insensitively.
    pub fn query_attribute(&self, port: usize, name: &str) -> Result<String> {
        let mut ports = self.ports.lock();
        let p = Self::port_mut(&mut ports, port)?;

        let value = match name.to_ascii_lowercase().as_str() {
            "csd" => p
                .times
                .setup_delay
                .map_or(0, |delay| delay.as_millis())
                .to_string(),
            "jitter_stats" => {
                self.update_jitter(p);
                p.jitter.to_string()
            }
            "jbbufsize" => p.jitter.size.to_string(),
            "jbunderflow" => p.jitter.underflow.to_string(),
            "jboverflow" => p.jitter.overflow.to_string(),
            "jbdelay" => p.jitter.delay.to_string(),
            "jbinvalid" => p.jitter.invalid.to_string(),
            "start" => format_time(p.times.start),
            "answer" => format_time(p.times.answer),
            _ => {
                warn!("Port {}: unknown line attribute '{}'", port, name);
                return Err(Error::UnknownAttribute(name.to_string()));
            }
        };
        Ok(value)
    }

    /// Device state of a 1-based port destination.
    pub fn device_state(&self, destination: &str) -> DeviceState {
        match self.parse_destination(destination) {
            Ok(port) => self
                .state(port)
                .map_or(DeviceState::Invalid, LineState::device_state),
            Err(_) => DeviceState::Invalid,
        }
    }

    // Media

    /// Send a frame from the owning leg to the line.
    pub fn write_frame(&self, port: usize, frame: &Frame) -> Result<()> {
        let voice = match frame {
            Frame::Voice(voice) => voice,
            other => {
                debug!("Port {}: unhandled frame type {:?}", port, other);
                return Ok(());
            }
        };

        let packets = {
            let mut ports = self.ports.lock();
            let p = Self::port_mut(&mut ports, port)?;

            if voice.codec != p.media.codec {
                debug!(
                    "Port {}: received {} frame but {} was expected",
                    port, voice.codec, p.media.codec
                );
                return Ok(());
            }
            if voice.data.is_empty() {
                debug!("Port {}: we've been prodded", port);
                return Ok(());
            }
            p.media.packetize(voice)
        };

        for packet in packets {
            let data = packet.encode();
            let written = self.device.write_media(port, &data).map_err(|e| {
                error!("Port {}: media write failed: {}", port, e);
                e
            })?;
            if written != data.len() {
                warn!(
                    "Port {}: short write, {} of {} bytes",
                    port,
                    written,
                    data.len()
                );
            }
        }
        Ok(())
    }

    /// Read one transport unit from the port and hand it to the owning leg.
    pub fn read_media(&self, port: usize) {
        let mut buf = [0u8; RTP_BUFFER_LEN];
        match self.device.read_media(port, &mut buf) {
            Ok(0) => error!("Port {}: media read returned no data", port),
            Ok(len) => self.deliver_media(port, Bytes::copy_from_slice(&buf[..len])),
            Err(e) => error!("Port {}: media read failed: {}", port, e),
        }
    }

    pub fn deliver_media(&self, port: usize, unit: Bytes) {
        let (owner, inbound) = {
            let ports = self.ports.lock();
            let Some(p) = ports.get(port) else {
                return;
            };
            let Some(owner) = p.owner.clone() else {
                return;
            };
            (owner, p.media.depacketize(unit))
        };

        let frame = match inbound {
            Inbound::Voice(frame) => frame,
            Inbound::ComfortNoise => {
                debug!("Port {}: dropping comfort noise frame", port);
                return;
            }
            Inbound::PayloadMismatch { payload_type } => {
                debug!(
                    "Port {}: unexpected RTP payload type {} ({})",
                    port,
                    payload_type,
                    Codec::from_payload_type(payload_type).map_or("unknown", Codec::name)
                );
                return;
            }
            Inbound::Empty => return,
            Inbound::Malformed => {
                debug!("Port {}: malformed media packet", port);
                return;
            }
        };

        match owner.try_lock() {
            Some(mut leg) if leg.is_up() => leg.enqueue_frame(Frame::Voice(frame)),
            Some(_) => {}
            None => trace!("Port {}: leg busy, frame dropped", port),
        };
    }

    // Internals

    fn port_mut<'a>(ports: &'a mut MutexGuard<'_, Vec<Port>>, port: usize) -> Result<&'a mut Port> {
        ports
            .get_mut(port)
            .ok_or_else(|| Error::unknown_port(port.to_string()))
    }

    fn parse_destination(&self, destination: &str) -> Result<usize> {
        let destination = destination.trim();
        if destination.is_empty() {
            error!("Unable to use an empty destination");
            return Err(Error::unknown_port(destination));
        }

        match destination.parse::<usize>() {
            Ok(n) if n >= 1 && n <= self.channels() => Ok(n - 1),
            _ => {
                error!("Unknown channel ID: \"{}\"", destination);
                Err(Error::unknown_port(destination))
            }
        }
    }

    fn accept_call(&self, p: &mut Port, owner: LegHandle, effects: &mut Vec<Outbound>) {
        let port = p.id;
        self.tone(port, Tone::None);
        if let Err(e) = self.device.ring_stop(port) {
            error!("Port {}: failed to stop ringing: {}", port, e);
        }

        let codec = p.media.codec;
        self.configure_media(p, codec);

        effects.push(Outbound::Signal(owner, Signal::Answered));
        p.state = LineState::InCall;
        let now = Utc::now();
        p.times.start = Some(now);
        p.times.answer = Some(now);
        info!("Port {} answered", port);
    }

    fn end_dialing(&self, p: &mut Port, effects: &mut Vec<Outbound>) {
        p.digits.cancel_timer();
        if let Some(owner) = p.owner.take() {
            self.update_jitter(p);
            effects.push(Outbound::Hangup(owner));
        }
        p.digits.reset();
    }

    fn end_call(&self, p: &mut Port, effects: &mut Vec<Outbound>) {
        if let Some(owner) = p.owner.take() {
            self.update_jitter(p);
            effects.push(Outbound::Hangup(owner));
        }
    }

    fn dial(&self, p: &mut Port, effects: &mut Vec<Outbound>) {
        let port = p.id;
        let extension = p.digits.take();
        let context = self.interfaces.port_context(port);
        debug!("Port {} wants to dial '{}' in {}", port, extension, context);

        if extension.is_empty() || !self.control.extension_exists(&context, &extension) {
            debug!("Port {}: no extension found", port);
            self.tone(port, Tone::Busy);
            p.state = LineState::CallEnded;
            return;
        }

        match self.control.new_leg(port, &extension, &context) {
            Ok(leg) => {
                info!("Port {}: extension {}@{} exists, starting call", port, extension, context);
                p.owner = Some(leg.clone());
                p.state = LineState::InCall;
                p.times = CallTimes {
                    setup_start: Some(Instant::now()),
                    start: Some(Utc::now()),
                    ..CallTimes::default()
                };
                effects.push(Outbound::Execute {
                    port,
                    leg,
                    extension,
                    context,
                });
            }
            Err(e) => {
                error!("Port {}: couldn't create call leg: {}", port, e);
                self.tone(port, Tone::Busy);
                p.state = LineState::CallEnded;
            }
        }
    }

    fn arm_dial_timer(&self, p: &mut Port) {
        let port = p.id;
        let generation = p.digits.next_generation();
        let lines = self.this.clone();
        let timeout = self.interdigit;

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(lines) = lines.upgrade() {
                lines.dial_timeout(port, generation);
            }
        });
        p.digits.arm(generation, handle);
        trace!("Port {}: dial timer {} armed", port, generation);
    }

    fn execution_failed(&self, port: usize, leg: &LegHandle) {
        let mut ports = self.ports.lock();
        let Some(p) = ports.get_mut(port) else {
            return;
        };
        if p.owner.as_ref().is_some_and(|owner| same_leg(owner, leg)) {
            self.update_jitter(p);
            p.owner = None;
            p.state = LineState::CallEnded;
            self.tone(port, Tone::Busy);
        }
    }

    fn perform(&self, effects: Vec<Outbound>) {
        for effect in effects {
            match effect {
                Outbound::Signal(leg, signal) => leg.lock().signal(signal),
                Outbound::Frame(leg, frame) => leg.lock().enqueue_frame(frame),
                Outbound::Hangup(leg) => leg.lock().request_hangup(),
                Outbound::Execute {
                    port,
                    leg,
                    extension,
                    context,
                } => {
                    if let Err(e) = self.control.start_execution(&leg, &extension, &context) {
                        warn!("Port {}: unable to start call to {}: {}", port, extension, e);
                        leg.lock().request_hangup();
                        self.execution_failed(port, &leg);
                    }
                }
            }
        }
    }

    fn configure_media(&self, p: &mut Port, codec: Codec) {
        let port = p.id;
        p.media.renegotiate(codec);
        debug!("Port {}: configuring encoder for {}", port, codec);

        if let Err(e) = self.device.configure_encoder(port, codec.params()) {
            error!("Port {}: encoder configuration failed: {}", port, e);
        }
        if let Err(e) = self.device.start_coders(port) {
            error!("Port {}: coder start failed: {}", port, e);
        }
    }

    fn standby(&self, port: usize) {
        debug!("Stopping line feed for port {}", port);
        let result = self
            .device
            .set_line_feed(port, LineFeed::Standby)
            .and_then(|_| self.device.stop_coders(port))
            .and_then(|_| self.device.play_tone(port, Tone::None));
        if let Err(e) = result {
            error!("Port {}: standby failed: {}", port, e);
        }
    }

    fn tone(&self, port: usize, tone: Tone) {
        if let Err(e) = self.device.play_tone(port, tone) {
            error!("Port {}: failed to play {:?} tone: {}", port, tone, e);
        }
    }

    fn update_jitter(&self, p: &mut Port) {
        match self.device.jitter_stats(p.id) {
            Ok(stats) => {
                debug!("Port {}: jitter buffer {}", p.id, stats);
                p.jitter = stats;
            }
            Err(e) => debug!("Port {}: error getting jitter buffer stats: {}", p.id, e),
        }
    }
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.unwrap_or_default()
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
