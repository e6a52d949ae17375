//! Command dispatcher: routes one inbound request to the allowlist, supervisor, or a helper,
//! and guarantees every request with a correlation id ends in exactly one `completed` event.

pub mod performance;
pub mod screenshot;
pub mod variables;

use crate::config::Config;
use crate::exec::{Allowlist, QuoteError};
use crate::gateway::{CommandRequest, EventSink, OutboundEvent, PerformanceRequest};
use crate::supervisor::{self, Session, SessionRegistry, SpawnError};
use std::path::PathBuf;
use std::sync::Arc;

pub use variables::VariableSources;

/// Status reported in `completed` when a request fails before or during execution.
pub const FAILED_STATUS: i32 = -1;

/// Why a request failed. Each variant becomes one stderr event plus `completed(-1)`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("command: {0} is not allowed on server.")]
    RejectedCommand(String),
    #[error("{label}: {target} is not valid. {reason}\n\n")]
    TargetInvalid {
        label: &'static str,
        target: String,
        reason: String,
    },
    #[error("{0}\n")]
    Spawn(#[from] SpawnError),
    #[error("{0}\n")]
    Quote(#[from] QuoteError),
    #[error("error running test on target: {target} - {reason}.. \n\n")]
    Measurement { target: String, reason: String },
    #[error("halted\n")]
    Halted,
    #[error("{0}\n")]
    Io(#[from] std::io::Error),
}

/// Per-server settings the dispatcher needs besides the allowlist.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub screenshot_dir: PathBuf,
    pub screenshot_helper: PathBuf,
    pub performance_probe: String,
    pub max_measurement_attempts: u32,
    pub variables: VariableSources,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            screenshot_dir: config.screenshot_dir.clone(),
            screenshot_helper: config.screenshot_helper.clone(),
            performance_probe: config.performance_probe.clone(),
            max_measurement_attempts: config.max_measurement_attempts,
            variables: VariableSources::default(),
        }
    }
}

/// Handles requests for all sessions; shared by every connection.
pub struct Dispatcher {
    allowlist: Arc<Allowlist>,
    registry: Arc<SessionRegistry>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        allowlist: Arc<Allowlist>,
        registry: Arc<SessionRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            allowlist,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one request for `session`. Never fails: errors are reported to the client.
    pub async fn handle(&self, session: &Session, request: CommandRequest, sink: Arc<dyn EventSink>) {
        let session_id = session.id();
        match request {
            CommandRequest::Variable { name, selector } => {
                log::info!("setting client variable: {} with command: {:?}", name, selector);
                let value = self.settings.variables.lookup(selector.as_deref());
                sink.emit(OutboundEvent::variable(name, value));
            }
            CommandRequest::Halt { id } => {
                self.registry.halt(session).await;
                log::info!("halting all commands for sid: {}", session_id);
                sink.emit(OutboundEvent::completed(&id, 0));
            }
            CommandRequest::Performance(req) => {
                let result = self.performance(session, &req, sink.as_ref()).await;
                finish(&req.id, result.map(|()| 0), sink.as_ref());
            }
            CommandRequest::Screenshot { id, target } => {
                let result = self.screenshot(session, &id, &target, sink.clone()).await;
                finish(&id, result, sink.as_ref());
            }
            CommandRequest::Command { id, cmd } => {
                let result = if self.allowlist.is_allowed(&cmd) {
                    log::info!("running {} for sid: {}", cmd, session_id);
                    supervisor::start(&self.registry, session, &cmd, &id, &[], sink.clone())
                        .await
                        .map_err(DispatchError::from)
                } else {
                    log::info!("rejected command {} for sid: {}", cmd, session_id);
                    Err(DispatchError::RejectedCommand(cmd.to_string()))
                };
                finish(&id, result, sink.as_ref());
            }
        }
    }

    async fn performance(
        &self,
        session: &Session,
        req: &PerformanceRequest,
        sink: &dyn EventSink,
    ) -> Result<(), DispatchError> {
        log::info!("running performance test with target: {}:{}", req.target, req.port);
        let address = performance::resolve_target(&req.target, req.port).await?;
        performance::PerformanceRun {
            registry: &self.registry,
            session,
            probe: &self.settings.performance_probe,
            max_attempts: self.settings.max_measurement_attempts,
            sink,
        }
        .run(req, address)
        .await
    }

    async fn screenshot(
        &self,
        session: &Session,
        id: &str,
        target: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<i32, DispatchError> {
        log::info!("getting web screen shot for: {}", target);
        screenshot::validate_target(target)?;
        tokio::fs::create_dir_all(&self.settings.screenshot_dir).await?;
        let file_name = screenshot::snapshot_file_name(target);
        let path = self.settings.screenshot_dir.join(&file_name);
        let cmd = screenshot::helper_command(&self.settings.screenshot_helper, target, &path);
        let env = [(
            "PYPPETEER_HOME".to_string(),
            self.settings.screenshot_dir.to_string_lossy().into_owned(),
        )];
        let code = supervisor::start(&self.registry, session, &cmd, id, &env, sink.clone()).await?;
        sink.emit(OutboundEvent::image(
            id,
            format!("{}/{}", screenshot::SCREENSHOT_ROUTE, file_name),
        ));
        Ok(code)
    }
}

/// Emit the terminal events for a request: `completed(status)`, or the error then `completed(-1)`.
fn finish(id: &str, result: Result<i32, DispatchError>, sink: &dyn EventSink) {
    let status = match result {
        Ok(status) => status,
        Err(e) => {
            log::info!("commandResponse to stderr for {}: {}", id, e.to_string().trim_end());
            sink.emit(OutboundEvent::stderr(id, e.to_string()));
            FAILED_STATUS
        }
    };
    log::info!("commandResponse to completed for {}: {}", id, status);
    sink.emit(OutboundEvent::completed(id, status));
}
