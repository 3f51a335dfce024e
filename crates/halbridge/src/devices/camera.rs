//! Remote camera server.
//!
//! The host creates the camera by sending an `init` event, after which the
//! handler answers the camera message set (`configure1`, parameter queries and
//! updates, shutter, camera start/stop and filming) and forwards camera signals
//! to the host from its poll tick.
//!
//! Frames are expensive on the wire, so only one is in flight at a time and
//! only while the host reports a consumer (`connected`). Frames produced while
//! one is outstanding are counted as lost.

use serde_json::{Map, Value, json};

use crate::bridge::protocol::{CameraInfo, DeviceEvent, Frame, InitConfig, TemperatureReading};
use crate::handler::{BridgeContext, RemoteHandler};
use crate::wire::{ResponseEntry, WireMessage};

/// Something the camera reports on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraSignal {
    EmccdGain(f64),
    NewFrame(Frame),
    ParametersChanged,
    Shutter(bool),
    Started,
    Stopped,
    Temperature(TemperatureReading),
}

impl From<CameraSignal> for DeviceEvent {
    fn from(signal: CameraSignal) -> Self {
        match signal {
            CameraSignal::EmccdGain(gain) => DeviceEvent::EmccdGain(gain),
            CameraSignal::NewFrame(frame) => DeviceEvent::NewFrame(frame),
            CameraSignal::ParametersChanged => DeviceEvent::ParametersChanged,
            CameraSignal::Shutter(open) => DeviceEvent::Shutter(open),
            CameraSignal::Started => DeviceEvent::Started,
            CameraSignal::Stopped => DeviceEvent::Stopped,
            CameraSignal::Temperature(reading) => DeviceEvent::Temperature(reading),
        }
    }
}

/// Camera driver interface.
pub trait CameraControl: Send {
    fn info(&self) -> CameraInfo;

    fn parameters(&self) -> Map<String, Value>;

    fn new_parameters(&mut self, parameters: &Value) -> anyhow::Result<()>;

    fn start_camera(&mut self) -> anyhow::Result<()>;

    fn stop_camera(&mut self) -> anyhow::Result<()>;

    fn start_film(&mut self, film_settings: &Value, is_time_base: bool) -> anyhow::Result<()>;

    fn stop_film(&mut self) -> anyhow::Result<()>;

    fn toggle_shutter(&mut self) -> anyhow::Result<()>;

    /// Signals raised since the last call.
    fn poll_signals(&mut self) -> Vec<CameraSignal>;

    fn clean_up(&mut self) {}
}

/// Builds the camera driver named in an `init` event.
pub type CameraFactory =
    Box<dyn Fn(&InitConfig) -> anyhow::Result<Box<dyn CameraControl>> + Send>;

pub struct RemoteCameraHandler {
    factory: CameraFactory,
    camera: Option<Box<dyn CameraControl>>,
    module_name: String,
    is_master: bool,
    remote_save: bool,
    film_settings: Value,
    connected: bool,
    n_sent: u32,
    n_lost: u64,
}

impl RemoteCameraHandler {
    pub fn new(factory: CameraFactory) -> Self {
        Self {
            factory,
            camera: None,
            module_name: "camera".to_string(),
            is_master: false,
            remote_save: false,
            film_settings: Value::Null,
            connected: false,
            n_sent: 0,
            n_lost: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.camera.is_some()
    }

    pub fn frames_lost(&self) -> u64 {
        self.n_lost
    }

    fn camera(&mut self) -> anyhow::Result<&mut Box<dyn CameraControl>> {
        self.camera
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("camera '{}' has not been initialized", self.module_name))
    }

    fn response(&self, data: Value) -> ResponseEntry {
        ResponseEntry::new(&self.module_name, data)
    }

    fn init(&mut self, config: InitConfig, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        if let Some(mut old) = self.camera.take() {
            tracing::debug!(camera = %self.module_name, "Replacing existing camera");
            old.clean_up();
        }
        tracing::info!(camera = %config.camera_name, remote_save = config.remote_save, "Creating camera");
        let camera = (self.factory)(&config)?;
        let info = camera.info();

        self.module_name = config.camera_name;
        self.remote_save = config.remote_save;
        self.is_master = info.is_master;
        self.camera = Some(camera);

        ctx.emit(DeviceEvent::CameraFunctionality(info))?;
        Ok(())
    }

    /// Hold, run the camera operation, release.
    fn held_operation(
        &mut self,
        message: WireMessage,
        ctx: &mut BridgeContext,
        op: impl FnOnce(&mut dyn CameraControl) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        ctx.hold(message)?;
        op(self.camera()?.as_mut())?;
        ctx.release()?;
        Ok(())
    }

    fn configure1(&mut self, message: WireMessage, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        // Hold so both broadcasts reach the host before this message completes.
        ctx.hold(message)?;

        let parameters = self.camera()?.parameters();
        let mut data = Map::new();
        data.insert("parameters".into(), Value::Object(parameters));
        ctx.send_message(WireMessage::new("initial parameters", &self.module_name).with_data(data))?;

        let mut data = Map::new();
        data.insert(
            "properties".into(),
            json!({
                "module name": self.module_name,
                "is camera": true,
                "is master": self.is_master,
            }),
        );
        ctx.send_message(WireMessage::new("configuration", &self.module_name).with_data(data))?;

        ctx.release()?;
        Ok(())
    }

    fn new_parameters(&mut self, message: WireMessage, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        let update = message
            .data()
            .get("parameters")
            .and_then(|all| all.get(&self.module_name))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no parameters for '{}'", self.module_name))?;
        ctx.hold(message)?;

        let old = self.camera()?.parameters();
        let old = self.response(json!({ "old parameters": old }));
        if let Some(held) = ctx.held_mut() {
            held.add_response(old);
        }

        self.camera()?.new_parameters(&update)?;

        let new = self.camera()?.parameters();
        let new = self.response(json!({ "new parameters": new }));
        if let Some(held) = ctx.held_mut() {
            held.add_response(new);
        }
        ctx.release()?;
        Ok(())
    }

    /// `start camera` / `stop camera` are sent once for the master and once
    /// for slaves; only the matching one is acted on.
    fn addressed_to_us(&self, message: &WireMessage) -> bool {
        message.data().get("master").and_then(Value::as_bool) == Some(self.is_master)
    }
}

impl RemoteHandler for RemoteCameraHandler {
    fn name(&self) -> &str {
        &self.module_name
    }

    fn process_message(&mut self, mut message: WireMessage, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        match message.message_type() {
            "configuration" if message.source_is("timing") => {
                let time_base = message
                    .data()
                    .get("properties")
                    .and_then(|p| p.get("functionality"))
                    .and_then(|f| f.get("time_base"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let is_time_base = time_base.as_deref() == Some(self.module_name.as_str());
                let film_settings = self.film_settings.clone();
                self.held_operation(message, ctx, |camera| {
                    camera.start_film(&film_settings, is_time_base)
                })?;
            }
            "configure1" => self.configure1(message, ctx)?,
            "current parameters" => {
                let parameters = self.camera()?.parameters();
                message.add_response(self.response(json!({ "parameters": parameters })));
                ctx.reply(message)?;
            }
            "new parameters" => self.new_parameters(message, ctx)?,
            "shutter clicked" => self.held_operation(message, ctx, |camera| camera.toggle_shutter())?,
            "start camera" if self.addressed_to_us(&message) => {
                self.n_lost = 0;
                self.held_operation(message, ctx, |camera| camera.start_camera())?;
            }
            "stop camera" if self.addressed_to_us(&message) => {
                self.held_operation(message, ctx, |camera| camera.stop_camera())?;
            }
            "start film" => {
                // Filming starts on the timing configuration that follows.
                self.film_settings = message.data().get("film settings").cloned().unwrap_or(Value::Null);
                ctx.reply(message)?;
            }
            "stop film" => {
                let parameters = self.camera()?.parameters();
                message.add_response(self.response(json!({ "parameters": parameters })));
                self.held_operation(message, ctx, |camera| camera.stop_film())?;
            }
            _ => ctx.reply(message)?,
        }
        Ok(())
    }

    fn process_event(&mut self, event: DeviceEvent, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        match event {
            DeviceEvent::Init(config) => self.init(config, ctx)?,
            DeviceEvent::Connected(connected) => {
                self.connected = connected;
                if !connected && self.n_lost > 0 {
                    tracing::info!(camera = %self.module_name, lost = self.n_lost, "Frames lost");
                    self.n_lost = 0;
                }
            }
            DeviceEvent::Received => self.n_sent = self.n_sent.saturating_sub(1),
            other => tracing::trace!(event = other.name(), "Ignoring event"),
        }
        Ok(())
    }

    fn poll(&mut self, ctx: &mut BridgeContext) -> anyhow::Result<()> {
        let Some(camera) = self.camera.as_mut() else {
            return Ok(());
        };
        for signal in camera.poll_signals() {
            match signal {
                CameraSignal::NewFrame(frame) => {
                    if !self.connected {
                        continue;
                    }
                    if self.n_sent == 0 {
                        self.n_sent += 1;
                        ctx.emit(DeviceEvent::NewFrame(frame))?;
                    } else {
                        self.n_lost += 1;
                    }
                }
                other => ctx.emit(other.into())?,
            }
        }
        Ok(())
    }

    fn clean_up(&mut self) {
        self.connected = false;
        self.n_sent = 0;
        self.remote_save = false;
        self.film_settings = Value::Null;
        if let Some(mut camera) = self.camera.take() {
            tracing::debug!(camera = %self.module_name, "Cleaning up camera");
            camera.clean_up();
        }
    }
}

/// Software camera producing flat test frames.
#[derive(Debug)]
pub struct SimulatedCamera {
    name: String,
    is_master: bool,
    parameters: Map<String, Value>,
    running: bool,
    shutter_open: bool,
    frame_number: u64,
    signals: Vec<CameraSignal>,
}

impl SimulatedCamera {
    pub fn new(name: impl Into<String>, config: &Map<String, Value>, is_master: bool) -> Self {
        let mut parameters = Map::new();
        parameters.insert("exposure_time".into(), json!(0.1));
        parameters.insert("x_pixels".into(), json!(64));
        parameters.insert("y_pixels".into(), json!(64));
        parameters.insert("emccd_gain".into(), json!(10.0));
        for (key, value) in config {
            parameters.insert(key.clone(), value.clone());
        }
        Self {
            name: name.into(),
            is_master,
            parameters,
            running: false,
            shutter_open: false,
            frame_number: 0,
            signals: Vec::new(),
        }
    }

    /// Build from an `init` event: `camera_params.parameters` overrides the
    /// defaults and `camera_params.master` selects master mode.
    pub fn from_init(config: &InitConfig) -> Self {
        let overrides = config
            .camera_params
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let is_master = config
            .camera_params
            .get("master")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Self::new(&config.camera_name, &overrides, is_master)
    }

    fn dimension(&self, key: &str) -> u32 {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(64)
    }

    fn next_frame(&mut self) -> Frame {
        self.frame_number += 1;
        let width = self.dimension("x_pixels");
        let height = self.dimension("y_pixels");
        let level = (self.frame_number % u64::from(u16::MAX)) as u16;
        Frame {
            camera: self.name.clone(),
            frame_number: self.frame_number,
            width,
            height,
            data: vec![level; width as usize * height as usize],
        }
    }
}

impl CameraControl for SimulatedCamera {
    fn info(&self) -> CameraInfo {
        CameraInfo {
            camera_name: self.name.clone(),
            have_emccd: true,
            have_preamp: false,
            have_shutter: true,
            have_temperature: true,
            is_master: self.is_master,
            parameters: self.parameters.clone(),
        }
    }

    fn parameters(&self) -> Map<String, Value> {
        self.parameters.clone()
    }

    fn new_parameters(&mut self, parameters: &Value) -> anyhow::Result<()> {
        let Some(update) = parameters.as_object() else {
            anyhow::bail!("camera parameters must be an object");
        };
        if self.running {
            anyhow::bail!("cannot change parameters while the camera is running");
        }
        let gain_before = self.parameters.get("emccd_gain").cloned();
        for (key, value) in update {
            self.parameters.insert(key.clone(), value.clone());
        }
        if self.parameters.get("emccd_gain") != gain_before.as_ref()
            && let Some(gain) = self.parameters.get("emccd_gain").and_then(Value::as_f64)
        {
            self.signals.push(CameraSignal::EmccdGain(gain));
        }
        self.signals.push(CameraSignal::ParametersChanged);
        Ok(())
    }

    fn start_camera(&mut self) -> anyhow::Result<()> {
        if !self.running {
            self.running = true;
            self.signals.push(CameraSignal::Started);
            self.signals.push(CameraSignal::Temperature(TemperatureReading {
                camera: self.name.clone(),
                temperature: -70.0,
                state: "stable".into(),
            }));
        }
        Ok(())
    }

    fn stop_camera(&mut self) -> anyhow::Result<()> {
        if self.running {
            self.running = false;
            self.signals.push(CameraSignal::Stopped);
        }
        Ok(())
    }

    fn start_film(&mut self, film_settings: &Value, is_time_base: bool) -> anyhow::Result<()> {
        tracing::debug!(camera = %self.name, is_time_base, ?film_settings, "Starting film");
        Ok(())
    }

    fn stop_film(&mut self) -> anyhow::Result<()> {
        tracing::debug!(camera = %self.name, frames = self.frame_number, "Stopping film");
        Ok(())
    }

    fn toggle_shutter(&mut self) -> anyhow::Result<()> {
        self.shutter_open = !self.shutter_open;
        self.signals.push(CameraSignal::Shutter(self.shutter_open));
        Ok(())
    }

    fn poll_signals(&mut self) -> Vec<CameraSignal> {
        if self.running {
            let frame = self.next_frame();
            self.signals.push(CameraSignal::NewFrame(frame));
        }
        std::mem::take(&mut self.signals)
    }

    fn clean_up(&mut self) {
        self.running = false;
        self.signals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{NotifyFrame, ReplyFrame, TaggedEvent};
    use crate::bridge::transport::Endpoint;
    use crate::config::ServerConfig;
    use crate::server::RemoteBridge;

    fn bridge() -> RemoteBridge<RemoteCameraHandler> {
        let config = ServerConfig::new(Endpoint::new("127.0.0.1", 0), Endpoint::new("127.0.0.1", 0));
        let factory: CameraFactory = Box::new(|init: &InitConfig| {
            let mut camera = SimulatedCamera::from_init(init);
            camera.parameters.insert("x_pixels".into(), json!(4));
            camera.parameters.insert("y_pixels".into(), json!(2));
            Ok(Box::new(camera) as Box<dyn CameraControl>)
        });
        RemoteBridge::new(config, RemoteCameraHandler::new(factory))
    }

    fn send(bridge: &mut RemoteBridge<RemoteCameraHandler>, event: DeviceEvent) {
        bridge.handle_event(event.encode().unwrap());
    }

    fn init(bridge: &mut RemoteBridge<RemoteCameraHandler>) {
        send(
            bridge,
            DeviceEvent::Init(InitConfig {
                camera_name: "camera1".into(),
                remote_save: false,
                camera_params: serde_json::from_value(json!({"master": true})).unwrap(),
            }),
        );
    }

    fn events(frames: &[NotifyFrame]) -> Vec<DeviceEvent> {
        frames
            .iter()
            .filter_map(|f| match f {
                NotifyFrame::Event { event } => Some(DeviceEvent::decode(event.clone()).unwrap()),
                NotifyFrame::Deferred { .. } => None,
            })
            .collect()
    }

    fn deferred(frames: &[NotifyFrame]) -> Vec<WireMessage> {
        frames
            .iter()
            .filter_map(|f| match f {
                NotifyFrame::Deferred { message } => Some(message.clone()),
                NotifyFrame::Event { .. } => None,
            })
            .collect()
    }

    fn with_data(message_type: &str, source: &str, data: Value) -> WireMessage {
        let Value::Object(map) = data else {
            panic!("data must be an object")
        };
        WireMessage::new(message_type, source).with_data(map)
    }

    #[test]
    fn init_reports_camera_functionality() {
        let mut bridge = bridge();
        init(&mut bridge);
        assert!(bridge.handler().is_initialized());
        assert_eq!(bridge.handler().name(), "camera1");

        let out = bridge.take_notifications();
        match &events(&out)[..] {
            [DeviceEvent::CameraFunctionality(info)] => {
                assert_eq!(info.camera_name, "camera1");
                assert!(info.is_master);
                assert_eq!(info.parameters["x_pixels"], json!(4));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn message_before_init_is_an_error_entry() {
        let mut bridge = bridge();
        match bridge.dispatch(WireMessage::new("current parameters", "settings")) {
            ReplyFrame::Completed { message } => assert!(message.has_errors()),
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[test]
    fn configure1_broadcasts_then_releases() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.take_notifications();

        let request = WireMessage::new("configure1", "hal");
        let id = request.id();
        assert!(matches!(bridge.dispatch(request), ReplyFrame::Wait { .. }));

        let out = bridge.take_notifications();
        assert_eq!(out.len(), 3);
        let sent: Vec<_> = events(&out)
            .into_iter()
            .map(|e| match e {
                DeviceEvent::SendMessage(m) => m,
                other => panic!("expected sendMessage, got {other:?}"),
            })
            .collect();
        assert_eq!(sent[0].message_type(), "initial parameters");
        assert_eq!(sent[1].message_type(), "configuration");
        assert_eq!(
            sent[1].data()["properties"],
            json!({"module name": "camera1", "is camera": true, "is master": true})
        );
        assert!(matches!(&out[2], NotifyFrame::Deferred { message } if message.id() == id));
    }

    #[test]
    fn new_parameters_reports_old_and_new() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.take_notifications();

        let request = with_data(
            "new parameters",
            "settings",
            json!({"parameters": {"camera1": {"exposure_time": 0.5}}}),
        );
        assert!(matches!(bridge.dispatch(request), ReplyFrame::Wait { .. }));

        let released = deferred(&bridge.take_notifications());
        let responses = released[0].responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].source, "camera1");
        assert_eq!(responses[0].data["old parameters"]["exposure_time"], json!(0.1));
        assert_eq!(responses[1].data["new parameters"]["exposure_time"], json!(0.5));

        bridge.tick();
        assert_eq!(events(&bridge.take_notifications()), vec![DeviceEvent::ParametersChanged]);
    }

    #[test]
    fn start_camera_only_when_addressed() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.take_notifications();

        let slave = with_data("start camera", "film", json!({"master": false}));
        assert!(matches!(bridge.dispatch(slave), ReplyFrame::Completed { .. }));

        let master = with_data("start camera", "film", json!({"master": true}));
        assert!(matches!(bridge.dispatch(master), ReplyFrame::Wait { .. }));
        assert_eq!(deferred(&bridge.take_notifications()).len(), 1);

        bridge.tick();
        let emitted = events(&bridge.take_notifications());
        assert_eq!(emitted[0], DeviceEvent::Started);
        assert!(matches!(emitted[1], DeviceEvent::Temperature(_)));
    }

    #[test]
    fn frames_only_flow_when_connected_one_at_a_time() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.dispatch(with_data("start camera", "film", json!({"master": true})));
        bridge.tick();
        bridge.take_notifications();

        // Nobody listening: frames are dropped without counting.
        bridge.tick();
        assert!(events(&bridge.take_notifications()).is_empty());
        assert_eq!(bridge.handler().frames_lost(), 0);

        send(&mut bridge, DeviceEvent::Connected(true));
        bridge.tick();
        let emitted = events(&bridge.take_notifications());
        assert!(matches!(&emitted[..], [DeviceEvent::NewFrame(f)] if f.width == 4 && f.data.len() == 8));

        // Previous frame not yet received.
        bridge.tick();
        bridge.tick();
        assert!(events(&bridge.take_notifications()).is_empty());
        assert_eq!(bridge.handler().frames_lost(), 2);

        send(&mut bridge, DeviceEvent::Received);
        bridge.tick();
        assert_eq!(events(&bridge.take_notifications()).len(), 1);

        send(&mut bridge, DeviceEvent::Connected(false));
        assert_eq!(bridge.handler().frames_lost(), 0);
    }

    #[test]
    fn timing_configuration_starts_film() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.take_notifications();

        let start = with_data("start film", "film", json!({"film settings": {"basename": "movie_01"}}));
        assert!(matches!(bridge.dispatch(start), ReplyFrame::Completed { .. }));

        let timing = with_data(
            "configuration",
            "timing",
            json!({"properties": {"functionality": {"time_base": "camera1"}}}),
        );
        assert!(matches!(bridge.dispatch(timing), ReplyFrame::Wait { .. }));
        assert_eq!(deferred(&bridge.take_notifications()).len(), 1);

        let other = WireMessage::new("configuration", "settings");
        assert!(matches!(bridge.dispatch(other), ReplyFrame::Completed { .. }));
    }

    #[test]
    fn stop_film_reports_parameters() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.take_notifications();

        assert!(matches!(bridge.dispatch(WireMessage::new("stop film", "film")), ReplyFrame::Wait { .. }));
        let released = deferred(&bridge.take_notifications());
        assert!(released[0].responses()[0].data.get("parameters").is_some());
    }

    #[test]
    fn shutter_clicked_emits_shutter_state() {
        let mut bridge = bridge();
        init(&mut bridge);
        bridge.take_notifications();

        assert!(matches!(bridge.dispatch(WireMessage::new("shutter clicked", "hal")), ReplyFrame::Wait { .. }));
        bridge.take_notifications();
        bridge.tick();
        assert_eq!(events(&bridge.take_notifications()), vec![DeviceEvent::Shutter(true)]);
    }

    #[test]
    fn unknown_event_tag_is_ignored() {
        let mut bridge = bridge();
        bridge.handle_event(TaggedEvent("stageMoved".into(), Value::Null));
        assert!(!bridge.handler().is_initialized());
    }
}
