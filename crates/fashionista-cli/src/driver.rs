use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use fashionista_contracts::controller::{
    Command, ControllerError, GenerationController, RenderFailure, RenderKey, RenderState,
    SelectedFile, SessionId, UploadState,
};
use fashionista_contracts::descriptor::RemoteImageHandle;
use fashionista_contracts::events::{new_session_id, EventPayload, EventWriter};
use fashionista_contracts::presets::PresetId;
use fashionista_contracts::retry::RetryPolicy;
use fashionista_engine::{DeliveryUrlBuilder, Relay, RelayClientError, RenderFetcher, RenderOutcome};
use serde_json::{json, Value};

#[derive(Debug)]
enum DriverEvent {
    UploadFinished {
        session: SessionId,
        result: Result<RemoteImageHandle, RelayClientError>,
    },
    RenderFinished {
        key: RenderKey,
        attempt: u32,
        outcome: RenderOutcome,
    },
    RetryDue {
        key: RenderKey,
        attempt: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetReport {
    pub preset: PresetId,
    pub state: String,
    pub url: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub upload: UploadState,
    pub public_id: Option<String>,
    pub preview_url: Option<String>,
    pub presets: Vec<PresetReport>,
    pub error: Option<String>,
}

/// Runs a [`GenerationController`] on one thread. Network effects execute on
/// helper threads and report back over a channel; retry timers are sleeping
/// threads that post when due.
pub struct GenerationDriver {
    controller: GenerationController,
    relay: Arc<dyn Relay>,
    fetcher: Arc<dyn RenderFetcher>,
    urls: DeliveryUrlBuilder,
    base_events: EventWriter,
    events: EventWriter,
    tx: Sender<DriverEvent>,
    rx: Receiver<DriverEvent>,
    pending: usize,
}

impl GenerationDriver {
    pub fn new(
        policy: RetryPolicy,
        relay: Arc<dyn Relay>,
        fetcher: Arc<dyn RenderFetcher>,
        urls: DeliveryUrlBuilder,
        events: EventWriter,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            controller: GenerationController::new(policy),
            relay,
            fetcher,
            urls,
            base_events: events.clone(),
            events,
            tx,
            rx,
            pending: 0,
        }
    }

    pub fn controller(&self) -> &GenerationController {
        &self.controller
    }

    pub fn submit(&mut self, file: Option<SelectedFile>) -> Result<(), ControllerError> {
        let command = self.controller.select_file(file)?;
        self.events = self.base_events.for_session(new_session_id());
        self.dispatch(command);
        Ok(())
    }

    pub fn select_image(&mut self, preset: PresetId) -> Result<Option<PresetId>, ControllerError> {
        self.controller.select_image(preset)
    }

    pub fn close_selection(&mut self) {
        self.controller.close_selection();
    }

    pub fn recolor_selected(&mut self, color: &str) -> Result<(), ControllerError> {
        let command = self.controller.recolor_selected(color)?;
        self.record_recolor(&command, color);
        self.dispatch(command);
        Ok(())
    }

    /// Applies recolors in order, settling after each so the same preset can
    /// be recolored again. Rejected recolors are logged and skipped.
    pub fn apply_recolors(&mut self, recolors: &[(PresetId, String)]) -> Result<usize> {
        let mut applied = 0;
        for (preset, color) in recolors {
            let result = self
                .select_image(*preset)
                .and_then(|_| self.recolor_selected(color));
            if let Err(err) = result {
                self.close_selection();
                log::error!("cannot recolor {preset}: {err}");
                continue;
            }
            log::info!("recoloring {preset} to {color}");
            applied += 1;
            self.run_until_settled()?;
        }
        Ok(applied)
    }

    /// Processes events until no upload or render is pending.
    pub fn run_until_settled(&mut self) -> Result<()> {
        while !self.controller.is_settled() {
            if self.pending == 0 {
                bail!("generation stalled with no pending work");
            }
            let event = self
                .rx
                .recv()
                .context("generation event channel closed")?;
            self.pending -= 1;
            self.handle(event);
        }
        Ok(())
    }

    pub fn report(&self) -> GenerationReport {
        let presets = self
            .controller
            .presets()
            .into_iter()
            .filter_map(|preset| {
                let descriptor = self.controller.descriptor(preset)?;
                let state = self.controller.render_state(preset)?;
                let reason = match state {
                    RenderState::Abandoned { reason } => Some(reason.clone()),
                    _ => None,
                };
                Some(PresetReport {
                    preset,
                    state: state.label().to_string(),
                    url: self.urls.url(descriptor),
                    reason,
                })
            })
            .collect();
        GenerationReport {
            upload: self.controller.upload_state().clone(),
            public_id: self
                .controller
                .handle()
                .map(|handle| handle.public_id().to_string()),
            preview_url: self
                .controller
                .preview()
                .map(|descriptor| self.urls.url(descriptor)),
            presets,
            error: self.controller.error().map(str::to_string),
        }
    }

    fn handle(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::UploadFinished { session, result } => match result {
                Ok(handle) => {
                    let public_id = handle.public_id().to_string();
                    let commands = self.controller.upload_succeeded(session, handle);
                    if commands.is_empty() {
                        log::debug!("dropping stale upload result for session {session}");
                        return;
                    }
                    log::info!("uploaded image '{public_id}'");
                    self.emit("upload_completed", json!({ "public_id": public_id }));
                    for command in commands {
                        self.dispatch(command);
                    }
                }
                Err(err) => {
                    if self.controller.upload_failed(session, err.message()) {
                        log::error!("Error uploading image: {err}");
                        self.emit("upload_failed", json!({ "error": err.message() }));
                    }
                }
            },
            DriverEvent::RenderFinished {
                key,
                attempt,
                outcome,
            } => match outcome {
                RenderOutcome::Loaded { bytes } => {
                    if self.controller.render_loaded(key) {
                        log::info!("{} loaded ({bytes} bytes)", key.preset);
                        self.emit(
                            "render_loaded",
                            json!({ "preset": key.preset, "attempt": attempt, "bytes": bytes }),
                        );
                    }
                }
                RenderOutcome::RateLimited => {
                    log::warn!(
                        "{} still generating (attempt {})",
                        key.preset,
                        attempt + 1
                    );
                    self.render_failed(key, RenderFailure::RateLimited);
                }
                RenderOutcome::Failed(message) => {
                    log::error!("error loading {}: {message}", key.preset);
                    self.render_failed(key, RenderFailure::Other(message));
                }
            },
            DriverEvent::RetryDue { key, attempt } => {
                if let Some(command) = self.controller.retry_due(key, attempt) {
                    self.dispatch(command);
                }
            }
        }
    }

    fn render_failed(&mut self, key: RenderKey, failure: RenderFailure) {
        let was_loading = self.controller.is_loading(key.preset);
        match self.controller.render_failed(key, failure) {
            Some(command) => self.dispatch(command),
            None => {
                let abandoned = was_loading && !self.controller.is_loading(key.preset);
                if abandoned && self.controller.session() == Some(key.session) {
                    let reason = match self.controller.render_state(key.preset) {
                        Some(RenderState::Abandoned { reason }) => reason.clone(),
                        _ => String::new(),
                    };
                    self.emit(
                        "render_abandoned",
                        json!({ "preset": key.preset, "reason": reason }),
                    );
                }
            }
        }
    }

    fn dispatch(&mut self, command: Command) {
        let tx = self.tx.clone();
        match command {
            Command::Upload { session, file } => {
                self.emit(
                    "upload_started",
                    json!({ "file": file.path.to_string_lossy() }),
                );
                let relay = Arc::clone(&self.relay);
                self.pending += 1;
                thread::spawn(move || {
                    let result = relay.upload(&file);
                    let _ = tx.send(DriverEvent::UploadFinished { session, result });
                });
            }
            Command::Render {
                key,
                attempt,
                descriptor,
            } => {
                let url = self.urls.url(&descriptor);
                log::debug!("rendering {} attempt {attempt}: {url}", key.preset);
                self.emit(
                    "render_started",
                    json!({ "preset": key.preset, "attempt": attempt, "url": url }),
                );
                let fetcher = Arc::clone(&self.fetcher);
                self.pending += 1;
                thread::spawn(move || {
                    let outcome = fetcher.fetch(&url);
                    let _ = tx.send(DriverEvent::RenderFinished {
                        key,
                        attempt,
                        outcome,
                    });
                });
            }
            Command::ScheduleRetry {
                key,
                attempt,
                delay,
            } => {
                log::info!(
                    "retrying {} in {:.1}s (retry {attempt}/{})",
                    key.preset,
                    delay.as_secs_f64(),
                    self.controller.policy().max_attempts
                );
                self.emit(
                    "render_retry_scheduled",
                    json!({
                        "preset": key.preset,
                        "attempt": attempt,
                        "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    }),
                );
                self.pending += 1;
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = tx.send(DriverEvent::RetryDue { key, attempt });
                });
            }
        }
    }

    fn record_recolor(&self, command: &Command, color: &str) {
        if let Command::Render { key, .. } = command {
            self.emit(
                "recolor_applied",
                json!({ "preset": key.preset, "color": color, "revision": key.revision }),
            );
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let payload = payload.as_object().cloned().unwrap_or_else(EventPayload::new);
        if let Err(err) = self.events.emit(event_type, payload) {
            log::warn!("failed writing {event_type} event: {err:#}");
        }
    }
}
