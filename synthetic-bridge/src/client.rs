//! Simulation client - the lifecycle of one station
//!
//! ```text
//! NEW -> DISCOVERING -> REGISTERING -> ACTIVE (poll every polling_interval)
//!             \______________\____________\__ failure -> RETRYING -> same step
//!                                             exhausted -> FAILED
//! any non-terminal --Delete--> DELETING -> DELETED (forced locally once retries run out)
//! ```
//!
//! Each client runs as its own task, mutates only its own status cell and watches the
//! fleet command channel at every suspension point (remote call or timer).

use crate::generator::ValueGenerator;
use crate::services::{RegistrationRequest, ServiceError, Services};
use crate::state::Shared;
use crate::station::{ClientConfig, Endpoint, RuntimeStatus, SessionHandle, StationId, StationState, Step};
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Fleet-wide instruction broadcast to every client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetCommand {
    Run,
    Stop,
    Delete,
}

/// How a client task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub id: StationId,
    pub state: StationState,
    /// Removed locally although the collection service never confirmed the deregistration
    pub forced_deletion: bool,
    /// Ended by a stop command rather than by reaching a terminal state
    pub stopped: bool,
}

enum Exit {
    Stopped,
    Failed,
    Deleted { forced: bool },
    /// A delete command arrived while running
    Delete,
}

/// Wait until the fleet command differs from `current`; a closed channel means stop
async fn command_change(commands: &mut watch::Receiver<FleetCommand>, current: FleetCommand) -> FleetCommand {
    match commands.wait_for(|command| *command != current).await {
        Ok(command) => *command,
        Err(_) => FleetCommand::Stop,
    }
}

/// Run `work` unless the fleet command leaves `current` first
async fn guarded<F: Future>(
    commands: &mut watch::Receiver<FleetCommand>,
    current: FleetCommand,
    work: F,
) -> Result<F::Output, FleetCommand> {
    tokio::select! {
        biased;
        command = command_change(commands, current) => Err(command),
        output = work => Ok(output),
    }
}

pub struct SimulationClient {
    config: ClientConfig,
    status: Shared<RuntimeStatus>,
    services: Services,
    generator: ValueGenerator,
    start_delay: Option<Duration>,
}

impl SimulationClient {
    pub fn new(config: ClientConfig, status: Shared<RuntimeStatus>, services: Services) -> Self {
        let generator = ValueGenerator::for_station(&config);
        Self {
            config,
            status,
            services,
            generator,
            start_delay: None,
        }
    }

    /// Stagger fleet start-up
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay).filter(|d| !d.is_zero());
        self
    }

    pub fn id(&self) -> StationId {
        self.config.id
    }

    /// Drive the station until it is stopped or reaches a terminal state
    pub async fn run(mut self, mut commands: watch::Receiver<FleetCommand>) -> ClientReport {
        let id = self.id();
        let exit = match self.start(&mut commands).await {
            Exit::Delete => self.delete(&mut commands).await,
            exit => exit,
        };

        let state = self.status.lock().state;
        let (forced_deletion, stopped) = match exit {
            Exit::Deleted { forced } => (forced, false),
            Exit::Stopped => (false, true),
            _ => (false, false),
        };
        debug!(station = %id, %state, stopped, "Client finished");
        ClientReport {
            id,
            state,
            forced_deletion,
            stopped,
        }
    }

    async fn start(&mut self, commands: &mut watch::Receiver<FleetCommand>) -> Exit {
        let initial = *commands.borrow_and_update();
        match initial {
            FleetCommand::Stop => return Exit::Stopped,
            FleetCommand::Delete => return Exit::Delete,
            FleetCommand::Run => {}
        }
        if let Some(delay) = self.start_delay {
            if let Err(command) = guarded(commands, FleetCommand::Run, tokio::time::sleep(delay)).await {
                return Self::interrupted(command);
            }
        }
        self.lifecycle(commands).await
    }

    fn interrupted(command: FleetCommand) -> Exit {
        match command {
            FleetCommand::Delete => Exit::Delete,
            _ => Exit::Stopped,
        }
    }

    fn update(&self, apply: impl FnOnce(&mut RuntimeStatus)) {
        apply(&mut self.status.lock());
    }

    fn set_state(&self, state: StationState) {
        self.update(|status| status.state = state);
    }

    fn record_success(&self) {
        self.update(|status| {
            status.consecutive_failures = 0;
            status.failed_step = None;
        });
    }

    /// Count a failed attempt; true when the step may be retried
    fn record_failure(&self, step: Step, error: &ServiceError) -> bool {
        let max_retries = self.config.network.max_retries;
        let mut status = self.status.lock();
        status.consecutive_failures += 1;
        status.failed_step = Some(step);
        let retry = error.is_retryable() && status.consecutive_failures <= max_retries;

        let id = self.config.id;
        let attempt = status.consecutive_failures;
        if retry {
            warn!(station = %id, %step, attempt, max_retries, "Step failed: {}", error);
        } else {
            error!(station = %id, %step, attempt, "Step failed, giving up: {}", error);
        }
        retry
    }

    /// Discovery -> registration -> polling, retrying each step on failure
    async fn lifecycle(&mut self, commands: &mut watch::Receiver<FleetCommand>) -> Exit {
        let retry_interval = self.config.network.retry_interval();
        let polling_interval = self.config.network.polling_interval();
        let mut step = Step::Discover;

        loop {
            self.set_state(match step {
                Step::Discover => StationState::Discovering,
                Step::Register => StationState::Registering,
                _ => StationState::Active,
            });

            let result = match guarded(commands, FleetCommand::Run, self.attempt(step)).await {
                Ok(result) => result,
                Err(command) => return Self::interrupted(command),
            };

            let pause = match result {
                Ok(next) => {
                    if next == Step::Poll && step != Step::Poll {
                        info!(station = %self.id(), "Station active");
                    }
                    let pause = (step == Step::Poll && next == Step::Poll).then_some(polling_interval);
                    step = next;
                    pause
                }
                Err(error) => {
                    if !self.record_failure(step, &error) {
                        self.set_state(StationState::Failed);
                        return Exit::Failed;
                    }
                    self.set_state(StationState::Retrying);
                    Some(retry_interval)
                }
            };

            if let Some(pause) = pause {
                if let Err(command) = guarded(commands, FleetCommand::Run, tokio::time::sleep(pause)).await {
                    return Self::interrupted(command);
                }
            }
        }
    }

    /// One attempt at `step`; on success returns the step to run next
    async fn attempt(&mut self, step: Step) -> Result<Step, ServiceError> {
        match step {
            Step::Discover => {
                let endpoint = self.resolve_endpoint().await?;
                self.update(|status| status.endpoint = Some(endpoint));
                self.record_success();
                Ok(Step::Register)
            }
            Step::Register => {
                let Some(endpoint) = self.status.lock().endpoint.clone() else {
                    return Ok(Step::Discover);
                };
                let previous = self.status.lock().session.as_ref().map(|s| s.station_id.clone());
                if let Some(previous) = previous {
                    debug!(station = %self.id(), remote_id = %previous, "Replacing registration from an earlier run");
                }
                let request = RegistrationRequest::for_station(&self.config);
                let session = self
                    .call(self.services.collection.register(&endpoint, &request))
                    .await?;
                info!(station = %self.id(), remote_id = %session.station_id, "Station registered at {}", endpoint.host);
                self.update(|status| status.session = Some(session));
                self.record_success();
                Ok(Step::Poll)
            }
            Step::Poll => {
                let (endpoint, session) = {
                    let status = self.status.lock();
                    (status.endpoint.clone(), status.session.clone())
                };
                let (Some(endpoint), Some(session)) = (endpoint, session) else {
                    return Ok(Step::Register);
                };
                self.submit(&endpoint, &session).await?;
                Ok(Step::Poll)
            }
            Step::Deregister => {
                let session = self.status.lock().session.clone();
                if let Some(session) = session {
                    self.deregister(&session).await?;
                }
                Ok(Step::Deregister)
            }
        }
    }

    async fn submit(&mut self, endpoint: &Endpoint, session: &SessionHandle) -> Result<(), ServiceError> {
        let at = Utc::now();
        let Some(value) = self.generator.next_reading(at, &self.config.position) else {
            debug!(station = %self.id(), "Reading skipped");
            return Ok(());
        };
        self.call(self.services.collection.submit_reading(endpoint, session, at, value))
            .await?;
        debug!(station = %self.id(), value, "Reading submitted");
        self.update(|status| {
            status.last_success_at = Some(at);
            status.consecutive_failures = 0;
            status.failed_step = None;
        });
        Ok(())
    }

    /// The override address, or whatever the lookup service answers for our position
    async fn resolve_endpoint(&self) -> Result<Endpoint, ServiceError> {
        let network = &self.config.network;
        if let Some(endpoint) = network.collection_override() {
            return Ok(endpoint);
        }
        let lookup = network.lookup_endpoint();
        let found = self
            .call(self.services.lookup.lookup(&lookup, &self.config.position))
            .await?;
        Ok(Endpoint {
            use_tls: found.use_tls && network.collection_use_tls,
            ..found
        })
    }

    /// Bound a remote call by the request timeout
    async fn call<T>(&self, request: impl Future<Output = Result<T, ServiceError>>) -> Result<T, ServiceError> {
        let timeout = self.config.network.request_timeout();
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Transport(format!("no response within {:?}", timeout))),
        }
    }

    /// Graceful removal; only a stop command interrupts it
    async fn delete(&mut self, commands: &mut watch::Receiver<FleetCommand>) -> Exit {
        let id = self.id();
        let session = {
            let mut status = self.status.lock();
            status.state = StationState::Deleting;
            status.consecutive_failures = 0;
            status.failed_step = None;
            status.session.clone()
        };

        let Some(session) = session else {
            info!(station = %id, "Station holds no registration, deleted locally");
            self.set_state(StationState::Deleted);
            return Exit::Deleted { forced: false };
        };

        let retry_interval = self.config.network.retry_interval();
        loop {
            let result = match guarded(commands, FleetCommand::Delete, self.attempt(Step::Deregister)).await {
                Ok(result) => result,
                Err(_) => return Exit::Stopped,
            };

            match result {
                Ok(_) => {
                    info!(station = %id, remote_id = %session.station_id, "Station deregistered");
                    self.update(|status| {
                        *status = RuntimeStatus {
                            state: StationState::Deleted,
                            ..RuntimeStatus::default()
                        }
                    });
                    return Exit::Deleted { forced: false };
                }
                Err(error) => {
                    if !self.record_failure(Step::Deregister, &error) {
                        warn!(
                            station = %id,
                            remote_id = %session.station_id,
                            "Deregistration never confirmed, removing station locally; the collection service may keep a stale entry"
                        );
                        self.set_state(StationState::Deleted);
                        return Exit::Deleted { forced: true };
                    }
                }
            }

            if guarded(commands, FleetCommand::Delete, tokio::time::sleep(retry_interval))
                .await
                .is_err()
            {
                return Exit::Stopped;
            }
        }
    }

    async fn deregister(&self, session: &SessionHandle) -> Result<(), ServiceError> {
        let known = self.status.lock().endpoint.clone();
        let endpoint = match known {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = self.resolve_endpoint().await?;
                self.update(|status| status.endpoint = Some(endpoint.clone()));
                endpoint
            }
        };
        self.call(self.services.collection.deregister(&endpoint, session))
            .await
    }
}
