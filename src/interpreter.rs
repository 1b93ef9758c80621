// src/interpreter.rs
//! The interpretation engine: one device, one parse loop, one navigation
//! snapshot.
//!
//! The interpreter owns at most one active [`Device`], reads NMEA sentences
//! from it on a dedicated task and folds them into a [`NavigationState`]
//! through validating setters. Lifecycle commands (`start`, `stop`, `pause`,
//! `resume`) serialize on a command lock with a timeout, so overlapping
//! commands fail fast as [`GpsError::Busy`] instead of interleaving.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Local, NaiveDate, NaiveTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceRegistry};
use crate::error::{GpsError, Result};
use crate::events::{EventSender, InterpreterEvent, NavData};
use crate::filter::PositionFilter;
use crate::nav::{
    FixMethod, FixMode, FixQuality, FixStatus, NavigationState, Position, Satellite,
};
use crate::nmea::{Sentence, SentenceReader};
use crate::options::InterpreterOptions;

/// Expected error of a differential fix, meters.
const DGPS_PRECISION: f64 = 2.75;
/// Expected error of a fixed RTK solution, meters.
const RTK_FIXED_PRECISION: f64 = 0.03;
/// Expected error of a float RTK solution, meters.
const RTK_FLOAT_PRECISION: f64 = 0.60;

/// Where the engine currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterState {
    Stopped,
    Running,
    Paused,
}

struct CommandState {
    worker: Option<JoinHandle<()>>,
    token: CancellationToken,
}

/// The GPS interpretation engine.
///
/// Cloning an `Interpreter` clones a handle to the same engine. Any clone
/// may issue lifecycle commands or read the navigation snapshot; the parse
/// worker is the only writer.
#[derive(Clone)]
pub struct Interpreter {
    inner: Arc<InterpreterInner>,
}

struct InterpreterInner {
    registry: Arc<DeviceRegistry>,
    options: RwLock<InterpreterOptions>,
    navigation: RwLock<NavigationState>,
    filter: Mutex<PositionFilter>,
    /// PRNs the last GSA named as participating in the fix.
    fixed_prns: Mutex<Vec<u8>>,
    device: Mutex<Option<Device>>,
    state: Mutex<InterpreterState>,
    events: EventSender<InterpreterEvent>,
    /// Serializes start/stop/pause/resume. Held across awaits, so it is the
    /// async flavor; acquisition is bounded by `command_timeout`.
    command: AsyncMutex<CommandState>,
    /// The pause gate the worker blocks on between sentences.
    paused: watch::Sender<bool>,
    /// Raw-sentence sink, guarded independently of the command lock so
    /// recording can be toggled without contending with lifecycle commands.
    recording: Mutex<Option<Box<dyn Write + Send>>>,
}

impl Interpreter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self::with_options(registry, InterpreterOptions::default())
    }

    pub fn with_options(registry: Arc<DeviceRegistry>, options: InterpreterOptions) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(InterpreterInner {
                registry,
                options: RwLock::new(options),
                navigation: RwLock::new(NavigationState::new()),
                filter: Mutex::new(PositionFilter::new()),
                fixed_prns: Mutex::new(Vec::new()),
                device: Mutex::new(None),
                state: Mutex::new(InterpreterState::Stopped),
                events: EventSender::new(),
                command: AsyncMutex::new(CommandState {
                    worker: None,
                    token: CancellationToken::new(),
                }),
                paused,
                recording: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<InterpreterEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> InterpreterState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() != InterpreterState::Stopped
    }

    /// The device currently driving the engine, if any.
    pub fn device(&self) -> Option<Device> {
        self.inner.device.lock().clone()
    }

    /// Clone-out snapshot of the current navigation state.
    pub fn navigation(&self) -> NavigationState {
        self.inner.navigation.read().clone()
    }

    pub fn options(&self) -> InterpreterOptions {
        self.inner.options.read().clone()
    }

    pub fn set_options(&self, options: InterpreterOptions) {
        *self.inner.options.write() = options;
    }

    // ---- lifecycle ----------------------------------------------------

    /// Start the engine against the best device the registry can produce.
    pub async fn start(&self) -> Result<()> {
        self.start_inner(None).await
    }

    /// Start the engine against an explicit device.
    pub async fn start_with(&self, device: Device) -> Result<()> {
        self.start_inner(Some(device)).await
    }

    async fn start_inner(&self, explicit: Option<Device>) -> Result<()> {
        let mut command = self.lock_command("start").await?;

        match self.state() {
            InterpreterState::Running => return Ok(()),
            InterpreterState::Paused => {
                // start on a paused engine resumes the existing worker
                self.inner.events.send(InterpreterEvent::Starting);
                self.inner.paused.send_replace(false);
                *self.inner.state.lock() = InterpreterState::Running;
                self.inner.events.send(InterpreterEvent::Resumed);
                return Ok(());
            }
            InterpreterState::Stopped => {}
        }

        self.inner.events.send(InterpreterEvent::Starting);

        let prepared: Result<Device> = async {
            let device = match explicit {
                Some(device) => device,
                None => {
                    let timeout = self.options().discovery_timeout();
                    self.inner.registry.any_device(timeout).await?
                }
            };
            if !device.is_open() {
                device.open().await?;
            }
            Ok(device)
        }
        .await;

        let device = match prepared {
            Ok(device) => device,
            Err(e) => {
                self.inner.events.send(InterpreterEvent::Stopped);
                return Err(GpsError::command("start", e));
            }
        };

        *self.inner.device.lock() = Some(device.clone());
        self.inner.events.send(InterpreterEvent::DeviceChanged {
            device: device.name().to_string(),
        });

        self.inner.navigation.write().initialize();
        self.inner.filter.lock().reset();
        self.inner.fixed_prns.lock().clear();

        let token = CancellationToken::new();
        command.token = token.clone();
        self.inner.paused.send_replace(false);
        *self.inner.state.lock() = InterpreterState::Running;

        let weak = Arc::downgrade(&self.inner);
        let gate = self.inner.paused.subscribe();
        command.worker = Some(tokio::spawn(async move {
            Interpreter::run_worker(weak, gate, token).await;
        }));

        info!("interpreter started on {}", device.name());
        self.inner.events.send(InterpreterEvent::Started);
        Ok(())
    }

    /// Stop the engine: cancel the worker, join it with the command timeout,
    /// abort it if it overruns, close the device. Stopping a stopped engine
    /// is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut command = self.lock_command("stop").await?;

        if self.state() == InterpreterState::Stopped {
            // the worker may have stopped itself; just reap the handle
            if let Some(worker) = command.worker.take() {
                worker.abort();
            }
            return Ok(());
        }

        self.inner.events.send(InterpreterEvent::Stopping);
        command.token.cancel();
        // a paused worker is parked on the gate; release it so it can exit
        self.inner.paused.send_replace(false);

        if let Some(mut worker) = command.worker.take() {
            let timeout = self.options().command_timeout();
            if tokio::time::timeout(timeout, &mut worker).await.is_err() {
                warn!("parse worker did not stop within {:?}, aborting it", timeout);
                worker.abort();
            }
        }

        if let Some(device) = self.device() {
            device.close().await;
        }

        *self.inner.state.lock() = InterpreterState::Stopped;
        info!("interpreter stopped");
        self.inner.events.send(InterpreterEvent::Stopped);
        Ok(())
    }

    /// Park the worker between sentences. The device and worker stay alive.
    pub async fn pause(&self) -> Result<()> {
        let _command = self.lock_command("pause").await?;

        if self.state() != InterpreterState::Running {
            return Err(GpsError::command("pause", GpsError::NotRunning));
        }

        self.inner.paused.send_replace(true);
        *self.inner.state.lock() = InterpreterState::Paused;
        self.inner.events.send(InterpreterEvent::Paused);
        Ok(())
    }

    /// Release a paused worker. Resuming a running engine is a no-op.
    pub async fn resume(&self) -> Result<()> {
        let _command = self.lock_command("resume").await?;

        match self.state() {
            InterpreterState::Paused => {
                self.inner.paused.send_replace(false);
                *self.inner.state.lock() = InterpreterState::Running;
                self.inner.events.send(InterpreterEvent::Resumed);
                Ok(())
            }
            InterpreterState::Running => Ok(()),
            InterpreterState::Stopped => Err(GpsError::command("resume", GpsError::NotRunning)),
        }
    }

    async fn lock_command(
        &self,
        name: &'static str,
    ) -> Result<tokio::sync::MutexGuard<'_, CommandState>> {
        let timeout = self.options().command_timeout();
        tokio::time::timeout(timeout, self.inner.command.lock())
            .await
            .map_err(|_| GpsError::Busy { command: name })
    }

    // ---- recording ----------------------------------------------------

    /// Attach a sink that receives a copy of every raw sentence, line
    /// endings included. Replaces any previous sink.
    pub fn start_recording(&self, sink: Box<dyn Write + Send>) {
        *self.inner.recording.lock() = Some(sink);
    }

    /// Detach the recording sink and hand it back for flushing.
    pub fn stop_recording(&self) -> Option<Box<dyn Write + Send>> {
        self.inner.recording.lock().take()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.recording.lock().is_some()
    }

    fn record(&self, line: &str) {
        let mut recording = self.inner.recording.lock();
        if let Some(sink) = recording.as_mut() {
            let outcome = sink
                .write_all(line.as_bytes())
                .and_then(|_| sink.write_all(b"\r\n"));
            if let Err(e) = outcome {
                warn!("recording sink failed, detaching it: {}", e);
                *recording = None;
            }
        }
    }

    // ---- the parse worker ---------------------------------------------

    /// The parse loop. It holds only a weak engine handle between steps:
    /// when the last external `Interpreter` clone goes away, the engine's
    /// `Drop` cancels the token and the loop winds down instead of pinning
    /// the device and transport forever.
    async fn run_worker(
        weak: Weak<InterpreterInner>,
        mut gate: watch::Receiver<bool>,
        token: CancellationToken,
    ) {
        let mut reader: Option<SentenceReader> = None;
        let mut gsv = GsvAssembler::default();
        let mut attempts: i32 = 0;
        let mut reconnecting = false;

        loop {
            if token.is_cancelled() {
                return;
            }

            // pause gate: wait until un-paused, bailing out on cancellation
            tokio::select! {
                _ = token.cancelled() => return,
                result = gate.wait_for(|paused| !*paused) => {
                    if result.is_err() {
                        return;
                    }
                }
            }

            if reader.is_none() {
                let Some(engine) = Self::upgrade(&weak) else {
                    return;
                };
                match engine.acquire_reader(&token, reconnecting).await {
                    Ok(acquired) => {
                        reader = Some(acquired);
                        attempts = 0;
                        reconnecting = false;
                    }
                    Err(e) if e.is_cancelled() => return,
                    Err(e) => {
                        attempts += 1;
                        debug!("could not acquire a device stream: {}", e);
                        let options = engine.options();
                        let budget = options.maximum_reconnection_attempts();
                        if !options.allow_automatic_reconnection()
                            || (budget >= 0 && attempts >= budget)
                        {
                            warn!(
                                "giving up after {} failed reconnection attempt(s)",
                                attempts
                            );
                            engine.finish_worker().await;
                            return;
                        }
                        reconnecting = true;
                        drop(engine);
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(options.reconnection_delay()) => {}
                        }
                        continue;
                    }
                }
            }

            let Some(current) = reader.as_mut() else {
                continue;
            };
            // the read owns no engine handle: a silent device parks us here
            // indefinitely and must not keep the engine alive
            let next = tokio::select! {
                _ = token.cancelled() => return,
                result = current.next_sentence() => result,
            };

            let Some(engine) = Self::upgrade(&weak) else {
                return;
            };
            match next {
                Ok(raw) => {
                    engine.record(&raw.line);
                    engine.apply_sentence(raw.sentence, &mut gsv);
                }
                Err(e) if e.is_cancelled() => return,
                Err(e) if e.is_connection_loss() => {
                    warn!("connection lost: {}", e);
                    engine.inner.events.send(InterpreterEvent::ConnectionLost {
                        reason: e.to_string(),
                    });
                    reader = None;
                    if let Some(device) = engine.device() {
                        device.reset();
                    }

                    let options = engine.options();
                    if !options.allow_automatic_reconnection()
                        || options.maximum_reconnection_attempts() == 0
                    {
                        engine.finish_worker().await;
                        return;
                    }
                    reconnecting = true;
                    drop(engine);
                    // give the transport stack a moment to settle
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(options.reconnection_delay()) => {}
                    }
                }
                Err(e) => {
                    debug!("non-fatal parse loop error: {}", e);
                    engine.inner.events.send(InterpreterEvent::ExceptionOccurred {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn upgrade(weak: &Weak<InterpreterInner>) -> Option<Interpreter> {
        weak.upgrade().map(|inner| Interpreter { inner })
    }

    /// Check the open device's stream out, or find and open a replacement
    /// through the registry. `announce` re-fires the lifecycle events a
    /// device substitution warrants.
    async fn acquire_reader(
        &self,
        token: &CancellationToken,
        announce: bool,
    ) -> Result<SentenceReader> {
        let device = match self.device() {
            Some(device) if device.is_open() => device,
            _ => {
                if announce {
                    self.inner.events.send(InterpreterEvent::Starting);
                }
                let timeout = self.options().discovery_timeout();
                let found = tokio::select! {
                    _ = token.cancelled() => return Err(GpsError::Cancelled),
                    result = self.inner.registry.any_device(timeout) => result?,
                };
                if !found.is_open() {
                    found.open().await?;
                }
                *self.inner.device.lock() = Some(found.clone());
                self.inner.events.send(InterpreterEvent::DeviceChanged {
                    device: found.name().to_string(),
                });
                if announce {
                    info!("reconnected to {}", found.name());
                    self.inner.events.send(InterpreterEvent::Started);
                }
                found
            }
        };

        let transport = device.take_stream().await?;
        Ok(SentenceReader::new(transport))
    }

    /// Orderly self-exit: close the device and report the stop. Never takes
    /// the command lock, which `stop()` may be holding while joining us.
    async fn finish_worker(&self) {
        if let Some(device) = self.device() {
            device.close().await;
        }
        *self.inner.state.lock() = InterpreterState::Stopped;
        self.inner.events.send(InterpreterEvent::Stopped);
    }

    // ---- sentence dispatch --------------------------------------------

    fn apply_sentence(&self, sentence: Sentence, gsv: &mut GsvAssembler) {
        match sentence {
            Sentence::Gga {
                utc_time,
                position,
                fix_quality,
                satellites_in_use,
                horizontal_dop,
                altitude,
                geoidal_separation,
            } => {
                self.set_fix_quality(fix_quality);
                if fix_quality != FixQuality::Unknown {
                    self.set_fix_status(if fix_quality.is_fix() {
                        FixStatus::Fix
                    } else {
                        FixStatus::NoFix
                    });
                }
                if let Some(time) = utc_time {
                    if let Some(utc) = utc_from_time(time) {
                        self.set_utc_time(utc);
                    }
                }
                if let Some(dop) = horizontal_dop {
                    self.set_horizontal_dop(dop);
                }
                if let Some(count) = satellites_in_use {
                    self.set_fixed_satellite_count(count);
                }
                if let Some(altitude) = altitude {
                    self.set_altitude(altitude);
                }
                if let Some(separation) = geoidal_separation {
                    self.set_geoidal_separation(separation);
                }
                if let (Some(altitude), Some(separation)) = (altitude, geoidal_separation) {
                    self.set_altitude_above_ellipsoid(altitude + separation);
                }
                if let Some(position) = position {
                    self.set_position(position);
                }
            }
            Sentence::Rmc {
                utc_time,
                utc_date,
                is_valid,
                position,
                speed_kmh,
                bearing,
                magnetic_variation,
            } => {
                if !is_valid {
                    self.set_fix_status(FixStatus::NoFix);
                    return;
                }
                self.set_fix_status(FixStatus::Fix);
                if let (Some(date), Some(time)) = (utc_date, utc_time) {
                    self.set_utc_time(utc_from_date_time(date, time));
                }
                if let Some(speed) = speed_kmh {
                    self.set_speed(speed);
                }
                if let Some(bearing) = bearing {
                    self.set_bearing(bearing);
                }
                if let Some(variation) = magnetic_variation {
                    self.set_magnetic_variation(variation);
                }
                if let Some(position) = position {
                    self.set_position(position);
                }
            }
            Sentence::Gsa {
                fix_mode,
                fix_method,
                fixed_prns,
                mean_dop,
                horizontal_dop,
                vertical_dop,
            } => {
                self.set_fix_mode(fix_mode);
                self.set_fix_method(fix_method);
                if let Some(dop) = mean_dop {
                    self.set_mean_dop(dop);
                }
                if let Some(dop) = horizontal_dop {
                    self.set_horizontal_dop(dop);
                }
                if let Some(dop) = vertical_dop {
                    self.set_vertical_dop(dop);
                }
                self.set_fixed_satellites(fixed_prns);
            }
            Sentence::Gsv {
                total_messages,
                message_number,
                satellites,
                ..
            } => {
                if let Some(cycle) = gsv.ingest(total_messages, message_number, satellites) {
                    self.set_satellites(cycle);
                }
            }
            Sentence::Gll {
                position,
                utc_time,
                is_valid,
            } => {
                if !is_valid {
                    return;
                }
                if let Some(time) = utc_time {
                    if let Some(utc) = utc_from_time(time) {
                        self.set_utc_time(utc);
                    }
                }
                if let Some(position) = position {
                    self.set_position(position);
                }
            }
            Sentence::Vtg {
                bearing_true,
                speed_kmh,
                ..
            } => {
                if let Some(bearing) = bearing_true {
                    self.set_bearing(bearing);
                }
                if let Some(speed) = speed_kmh {
                    self.set_speed(speed);
                }
            }
            Sentence::Hdt { heading } => {
                if let Some(heading) = heading {
                    self.set_heading(heading);
                }
            }
            Sentence::Unsupported { sentence_type } => {
                debug!("ignoring unsupported sentence type {}", sentence_type);
            }
        }
    }

    // ---- state setters -------------------------------------------------
    //
    // One rule for all of them: validate first; invalid input is a complete
    // no-op. Valid input always fires `Received`, then `Changed` only when
    // the value differs from the previous one.

    fn publish(&self, data: NavData, changed: bool) {
        self.inner
            .events
            .send(InterpreterEvent::Received(data.clone()));
        if changed {
            self.inner.events.send(InterpreterEvent::Changed(data));
        }
    }

    /// Expected error of the current fix in meters, from a fixed table per
    /// fix quality. Qualities without a table entry fall back to the
    /// configured typical position error.
    pub fn fix_precision_estimate(&self) -> f64 {
        match self.inner.navigation.read().fix_quality {
            FixQuality::DifferentialGpsFix => DGPS_PRECISION,
            FixQuality::FixedRealTimeKinematic => RTK_FIXED_PRECISION,
            FixQuality::FloatRealTimeKinematic => RTK_FLOAT_PRECISION,
            _ => self.inner.options.read().typical_position_error(),
        }
    }

    /// Accept a position report, subject to the fix and DOP gates, and run
    /// it through the filter when enabled. The filter fails open to the raw
    /// value whenever its precision context is unusable.
    pub fn set_position(&self, value: Position) {
        let options = self.options();
        let (fix_status, hdop, vdop, bearing, speed) = {
            let nav = self.inner.navigation.read();
            (
                nav.fix_status,
                nav.horizontal_dop,
                nav.vertical_dop,
                nav.bearing,
                nav.speed,
            )
        };

        if options.is_fix_required() && fix_status != FixStatus::Fix {
            return;
        }
        if let Some(hdop) = hdop {
            if hdop > options.maximum_horizontal_dop() {
                return;
            }
        }
        if let Some(vdop) = vdop {
            if vdop > options.maximum_vertical_dop() {
                return;
            }
        }

        let value = if options.is_filter_enabled() {
            let precision = self.fix_precision_estimate();
            self.inner.filter.lock().filter(
                value,
                precision,
                hdop.unwrap_or(0.0),
                vdop.unwrap_or(0.0),
                bearing.unwrap_or(0.0),
                speed.unwrap_or(0.0),
            )
        } else {
            value
        };

        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.position != Some(value);
            nav.position = Some(value);
            changed
        };
        self.publish(NavData::Position(value), changed);
    }

    pub fn set_utc_time(&self, value: DateTime<Utc>) {
        if self.inner.registry.clock_synchronization_enabled() {
            let drift = (Utc::now() - value).num_milliseconds().abs();
            if drift > 2000 {
                warn!("device clock differs from the system clock by {} ms", drift);
            }
        }

        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.utc_time != Some(value);
            nav.utc_time = Some(value);
            nav.local_time = Some(value.with_timezone(&Local));
            changed
        };
        self.publish(NavData::UtcTime(value), changed);
    }

    pub fn set_speed(&self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.speed != Some(value);
            nav.speed = Some(value);
            changed
        };
        self.publish(NavData::Speed(value), changed);
    }

    pub fn set_bearing(&self, value: f64) {
        if !value.is_finite() || !(0.0..=360.0).contains(&value) {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.bearing != Some(value);
            nav.bearing = Some(value);
            changed
        };
        self.publish(NavData::Bearing(value), changed);
    }

    pub fn set_heading(&self, value: f64) {
        if !value.is_finite() || !(0.0..=360.0).contains(&value) {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.heading != Some(value);
            nav.heading = Some(value);
            changed
        };
        self.publish(NavData::Heading(value), changed);
    }

    pub fn set_altitude(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.altitude != Some(value);
            nav.altitude = Some(value);
            changed
        };
        self.publish(NavData::Altitude(value), changed);
    }

    pub fn set_altitude_above_ellipsoid(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.altitude_above_ellipsoid != Some(value);
            nav.altitude_above_ellipsoid = Some(value);
            changed
        };
        self.publish(NavData::AltitudeAboveEllipsoid(value), changed);
    }

    pub fn set_geoidal_separation(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.geoidal_separation != Some(value);
            nav.geoidal_separation = Some(value);
            changed
        };
        self.publish(NavData::GeoidalSeparation(value), changed);
    }

    pub fn set_magnetic_variation(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.magnetic_variation != Some(value);
            nav.magnetic_variation = Some(value);
            changed
        };
        self.publish(NavData::MagneticVariation(value), changed);
    }

    /// Fix transitions additionally raise `FixAcquired`/`FixLost`, both
    /// locally and on the registry's aggregated channel.
    pub fn set_fix_status(&self, value: FixStatus) {
        if value == FixStatus::Unknown {
            return;
        }
        let (changed, previous) = {
            let mut nav = self.inner.navigation.write();
            let previous = nav.fix_status;
            let changed = previous != value;
            nav.fix_status = value;
            (changed, previous)
        };
        self.publish(NavData::FixStatus(value), changed);

        if changed {
            let device = self
                .device()
                .map(|device| device.name().to_string())
                .unwrap_or_default();
            if value == FixStatus::Fix {
                self.inner.events.send(InterpreterEvent::FixAcquired);
                self.inner.registry.notify_fix_acquired(&device);
            } else if previous == FixStatus::Fix {
                self.inner.events.send(InterpreterEvent::FixLost);
                self.inner.registry.notify_fix_lost(&device);
            }
        }
    }

    pub fn set_fix_mode(&self, value: FixMode) {
        if value == FixMode::Unknown {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.fix_mode != value;
            nav.fix_mode = value;
            changed
        };
        self.publish(NavData::FixMode(value), changed);
    }

    pub fn set_fix_method(&self, value: FixMethod) {
        if value == FixMethod::Unknown {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.fix_method != value;
            nav.fix_method = value;
            changed
        };
        self.publish(NavData::FixMethod(value), changed);
    }

    pub fn set_fix_quality(&self, value: FixQuality) {
        if value == FixQuality::Unknown {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.fix_quality != value;
            nav.fix_quality = value;
            changed
        };
        self.publish(NavData::FixQuality(value), changed);
    }

    pub fn set_horizontal_dop(&self, value: f32) {
        if !value.is_finite() || value <= 0.0 {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.horizontal_dop != Some(value);
            nav.horizontal_dop = Some(value);
            changed
        };
        self.publish(NavData::HorizontalDop(value), changed);
    }

    pub fn set_vertical_dop(&self, value: f32) {
        if !value.is_finite() || value <= 0.0 {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.vertical_dop != Some(value);
            nav.vertical_dop = Some(value);
            changed
        };
        self.publish(NavData::VerticalDop(value), changed);
    }

    pub fn set_mean_dop(&self, value: f32) {
        if !value.is_finite() || value <= 0.0 {
            return;
        }
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.mean_dop != Some(value);
            nav.mean_dop = Some(value);
            changed
        };
        self.publish(NavData::MeanDop(value), changed);
    }

    pub fn set_fixed_satellite_count(&self, value: u8) {
        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.fixed_satellite_count != Some(value);
            nav.fixed_satellite_count = Some(value);
            changed
        };
        self.publish(NavData::FixedSatelliteCount(value), changed);
    }

    /// Record which PRNs participate in the fix and re-mark the satellite
    /// list accordingly.
    pub fn set_fixed_satellites(&self, prns: Vec<u8>) {
        *self.inner.fixed_prns.lock() = prns.clone();
        let (satellites, changed) = {
            let mut nav = self.inner.navigation.write();
            let mut changed = false;
            for satellite in nav.satellites.iter_mut() {
                let fixed = prns.contains(&satellite.prn);
                if satellite.is_fixed != fixed {
                    satellite.is_fixed = fixed;
                    changed = true;
                }
            }
            (nav.satellites.clone(), changed)
        };
        self.publish(NavData::Satellites(satellites), changed);
    }

    /// Replace the satellite list with one complete GSV cycle, de-duplicated
    /// by PRN and marked against the last known fixed set.
    pub fn set_satellites(&self, cycle: Vec<Satellite>) {
        let fixed_prns = self.inner.fixed_prns.lock().clone();
        let mut unique: Vec<Satellite> = Vec::with_capacity(cycle.len());
        for mut satellite in cycle {
            if unique.iter().any(|known| known.prn == satellite.prn) {
                continue;
            }
            satellite.is_fixed = fixed_prns.contains(&satellite.prn);
            unique.push(satellite);
        }

        let changed = {
            let mut nav = self.inner.navigation.write();
            let changed = nav.satellites != unique;
            nav.satellites = unique.clone();
            changed
        };
        self.publish(NavData::Satellites(unique), changed);
    }
}

/// Last-handle teardown: cancel and abort the worker, mark the device
/// closed. `stop()` remains the orderly path; this never blocks.
impl Drop for InterpreterInner {
    fn drop(&mut self) {
        let command = self.command.get_mut();
        command.token.cancel();
        if let Some(worker) = command.worker.take() {
            worker.abort();
        }
        if let Some(device) = self.device.get_mut().take() {
            device.reset();
        }
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("state", &self.state())
            .field("device", &self.device().map(|d| d.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// Reassembles multi-message GSV cycles into one satellite list.
#[derive(Default)]
struct GsvAssembler {
    pending: Vec<Satellite>,
}

impl GsvAssembler {
    fn ingest(
        &mut self,
        total_messages: u8,
        message_number: u8,
        satellites: Vec<Satellite>,
    ) -> Option<Vec<Satellite>> {
        if message_number <= 1 {
            self.pending.clear();
        }
        self.pending.extend(satellites);
        if message_number >= total_messages {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

/// A time-of-day only report gets today's date attached.
fn utc_from_time(time: NaiveTime) -> Option<DateTime<Utc>> {
    Some(Utc::now().date_naive().and_time(time).and_utc())
}

fn utc_from_date_time(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}
