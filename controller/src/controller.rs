use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use fireplace_common::{
    ecobee::{Event, Runtime},
    ControlAction, ControlConfig, ControlEngine, ControlStatus, PairingState, TickDecision,
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{actuator::Actuator, client::EcobeeClient, error::Result};

const SHUTDOWN_RESUME_TIMEOUT: Duration = Duration::from_secs(5);

struct ControlCell {
    engine: ControlEngine,
    last_evaluation: Option<DateTime<Utc>>,
}

/// Thermostat commands from one engine transition.
struct RemoteBatch {
    actions: Vec<ControlAction>,
    runtime: Option<Runtime>,
    done: oneshot::Sender<()>,
}

/// Single owner of the control state.
///
/// HTTP handlers, the evaluator task and the button listener all enter through these
/// methods. Engine transitions and the GPIO writes they imply happen under one lock.
/// Remote commands are queued under that lock and sent by a single task, so the
/// thermostat sees them in the order the engine issued them.
pub struct Controller {
    cell: Mutex<ControlCell>,
    remote: mpsc::UnboundedSender<RemoteBatch>,
    actuator: Arc<dyn Actuator>,
    client: Arc<EcobeeClient>,
    started: Instant,
    fatal: watch::Sender<Option<String>>,
    running_evaluators: AtomicUsize,
    peak_evaluators: AtomicUsize,
}

impl Controller {
    pub fn new(
        config: ControlConfig,
        actuator: Arc<dyn Actuator>,
        client: Arc<EcobeeClient>,
    ) -> Arc<Self> {
        let (fatal, _) = watch::channel(None);
        let (remote, queue) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            cell: Mutex::new(ControlCell {
                engine: ControlEngine::new(config),
                last_evaluation: None,
            }),
            remote,
            actuator,
            client,
            started: Instant::now(),
            fatal,
            running_evaluators: AtomicUsize::new(0),
            peak_evaluators: AtomicUsize::new(0),
        });
        tokio::spawn(send_remote_commands(Arc::downgrade(&controller), queue));
        controller
    }

    pub async fn start_loop(self: &Arc<Self>) -> Result<()> {
        info!("control loop start requested");
        self.run_intent(ControlEngine::start_loop).await
    }

    pub async fn stop_loop(self: &Arc<Self>) -> Result<()> {
        info!("control loop stop requested");
        self.run_intent(ControlEngine::stop_loop).await
    }

    pub async fn set_override(&self, target: i32) -> bool {
        let changed = self.cell.lock().await.engine.set_override(target);
        info!(target, changed, "override set");
        changed
    }

    pub async fn clear_override(&self) -> bool {
        let changed = self.cell.lock().await.engine.clear_override();
        info!(changed, "override cleared");
        changed
    }

    pub async fn request_refresh(&self) {
        self.cell.lock().await.engine.request_refresh();
    }

    pub async fn manual_on(self: &Arc<Self>) -> Result<()> {
        self.run_intent(ControlEngine::manual_on).await
    }

    pub async fn manual_off(self: &Arc<Self>) -> Result<()> {
        self.run_intent(ControlEngine::manual_off).await
    }

    pub async fn button_pressed(self: &Arc<Self>) -> Result<()> {
        self.run_intent(ControlEngine::button_edge).await
    }

    pub async fn begin_pairing(&self) -> Result<String> {
        self.client.begin_pairing().await
    }

    pub async fn complete_pairing(&self) -> Result<bool> {
        let authorized = self.client.complete_pairing().await?;
        if authorized {
            self.request_refresh().await;
        }
        Ok(authorized)
    }

    pub async fn events(&self) -> Result<Vec<Event>> {
        self.client.events().await
    }

    pub async fn status(&self) -> ControlStatus {
        let (state, threshold, last_differential, last_evaluation) = {
            let cell = self.cell.lock().await;
            (
                cell.engine.state().clone(),
                cell.engine.config.threshold,
                cell.engine.last_differential(),
                cell.last_evaluation,
            )
        };
        let pairing = self.client.pairing_state().await;

        let mut remote_error = None;
        let mut runtime = None;
        let mut sensor_readings = Vec::new();
        if pairing == PairingState::Paired {
            match self.client.runtime().await {
                Ok(value) => runtime = Some(value),
                Err(err) => remote_error = Some(err.to_string()),
            }
            match self.client.sensors().await {
                Ok(readings) => sensor_readings = readings,
                Err(err) => {
                    remote_error.get_or_insert_with(|| err.to_string());
                }
            }
        }

        ControlStatus {
            loop_active: state.loop_active,
            actuator_on: state.actuator_on,
            indicator_on: self.actuator.is_indicator_on(),
            fan_hold_active: state.fan_hold_active,
            override_target: state.override_target,
            current_temp: runtime.map(|r| r.actual_temperature),
            desired_temp: runtime.map(|r| r.desired_heat),
            last_differential,
            sensor_readings,
            threshold,
            pairing: pairing.as_str(),
            last_evaluation_epoch: last_evaluation.map(|at| at.timestamp()),
            remote_error,
        }
    }

    /// Routes button edges from the hardware context into `button_pressed`. Edges that
    /// arrive while a toggle is still pending are dropped.
    pub fn attach_button(self: &Arc<Self>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        self.actuator
            .register_button_edge_handler(Box::new(move || {
                if tx.try_send(()).is_err() {
                    debug!("button edge dropped, toggle pending");
                }
            }))?;

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                info!("button pressed");
                if let Err(err) = controller.button_pressed().await {
                    warn!("button action failed: {err}");
                }
            }
            debug!("button listener stopped");
        });
        Ok(())
    }

    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    /// Stops the loop and releases the hardware, then restores the thermostat program
    /// if a fan hold was left engaged.
    pub async fn shutdown(&self) -> Result<()> {
        let (pending, released) = {
            let mut cell = self.cell.lock().await;
            let actions = cell.engine.shutdown();
            let released = self.actuator.shutdown();
            (self.queue_remote(actions, None), released)
        };
        info!("fireplace and indicator off, GPIO released");

        if let Some(sent) = pending {
            match tokio::time::timeout(SHUTDOWN_RESUME_TIMEOUT, sent).await {
                Ok(_) => debug!("thermostat commands flushed"),
                Err(_) => warn!("resume program on shutdown timed out"),
            }
        }

        released
    }

    async fn run_intent<F>(self: &Arc<Self>, intent: F) -> Result<()>
    where
        F: FnOnce(&mut ControlEngine) -> Vec<ControlAction>,
    {
        let pending = {
            let mut cell = self.cell.lock().await;
            let actions = intent(&mut cell.engine);
            self.apply_local(&actions)?;
            self.queue_remote(actions, None)
        };
        if let Some(sent) = pending {
            let _ = sent.await;
        }
        Ok(())
    }

    /// Queues the remote half of `actions` and returns a receiver that resolves once it
    /// has been sent. Caller holds the cell lock.
    fn queue_remote(
        &self,
        actions: Vec<ControlAction>,
        runtime: Option<Runtime>,
    ) -> Option<oneshot::Receiver<()>> {
        let actions = remote_only(actions);
        if actions.is_empty() {
            return None;
        }
        let (done, sent) = oneshot::channel();
        let batch = RemoteBatch {
            actions,
            runtime,
            done,
        };
        if self.remote.send(batch).is_err() {
            warn!("remote command queue closed, thermostat not updated");
            return None;
        }
        Some(sent)
    }

    /// Applies GPIO actions and spawns the evaluator. Caller holds the cell lock.
    fn apply_local(self: &Arc<Self>, actions: &[ControlAction]) -> Result<()> {
        for action in actions {
            let written = match action {
                ControlAction::ActuatorOn => self.actuator.set_actuator(true),
                ControlAction::ActuatorOff => self.actuator.set_actuator(false),
                ControlAction::IndicatorOn => self.actuator.set_indicator(true),
                ControlAction::IndicatorOff => self.actuator.set_indicator(false),
                ControlAction::SpawnEvaluator => {
                    self.spawn_evaluator();
                    Ok(())
                }
                ControlAction::HoldFan | ControlAction::ResumeProgram => Ok(()),
            };
            if let Err(err) = written {
                error!("{action:?} failed: {err}");
                self.fatal.send_replace(Some(err.to_string()));
                return Err(err);
            }
        }
        Ok(())
    }

    async fn apply_remote(&self, actions: Vec<ControlAction>, runtime: Option<Runtime>) {
        for action in actions {
            let sent = match action {
                ControlAction::HoldFan => self.client.hold_fan(runtime).await,
                ControlAction::ResumeProgram => self.client.resume_program().await,
                _ => Ok(()),
            };
            if let Err(err) = sent {
                warn!("{action:?} not applied at thermostat: {err}");
                self.cell.lock().await.engine.remote_action_failed(action);
            }
        }
    }

    fn spawn_evaluator(self: &Arc<Self>) {
        let running = self.running_evaluators.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_evaluators.fetch_max(running, Ordering::SeqCst);
        debug!(running, "evaluator spawned");

        let controller = Arc::clone(self);
        let handle = tokio::spawn(controller.evaluate_loop());

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                error!("evaluator terminated abnormally, stopping control loop: {err}");
                watcher.running_evaluators.fetch_sub(1, Ordering::SeqCst);
                if let Err(err) = watcher.run_intent(ControlEngine::evaluator_lost).await {
                    warn!("stopping control loop failed: {err}");
                }
            }
        });
    }

    async fn evaluate_loop(self: Arc<Self>) {
        let tick = self.cell.lock().await.engine.config.tick();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let decision = {
                let mut cell = self.cell.lock().await;
                let decision = cell.engine.tick(self.now_ms());
                if decision == TickDecision::Exit {
                    self.running_evaluators.fetch_sub(1, Ordering::SeqCst);
                }
                decision
            };

            match decision {
                TickDecision::Exit => {
                    info!("control loop stopped, evaluator exiting");
                    return;
                }
                TickDecision::Wait => {}
                TickDecision::Evaluate => self.evaluate_once().await,
            }
        }
    }

    async fn evaluate_once(self: &Arc<Self>) {
        let runtime = match self.client.runtime().await {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!("evaluation skipped: {err}");
                self.cell.lock().await.engine.skip_evaluation(self.now_ms());
                return;
            }
        };
        let sample = runtime.sample();

        let pending = {
            let mut cell = self.cell.lock().await;
            let actions = cell.engine.evaluate(sample, self.now_ms());
            cell.last_evaluation = Some(Utc::now());
            debug!(
                actual = sample.actual,
                desired = sample.desired,
                differential = cell.engine.last_differential(),
                "evaluated"
            );
            if self.apply_local(&actions).is_err() {
                return;
            }
            self.queue_remote(actions, Some(runtime))
        };
        if let Some(sent) = pending {
            let _ = sent.await;
        }
    }

    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

fn remote_only(actions: Vec<ControlAction>) -> Vec<ControlAction> {
    actions.into_iter().filter(|a| a.is_remote()).collect()
}

/// Drains the remote command queue one batch at a time. Ends with the controller.
async fn send_remote_commands(
    controller: Weak<Controller>,
    mut queue: mpsc::UnboundedReceiver<RemoteBatch>,
) {
    while let Some(batch) = queue.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.apply_remote(batch.actions, batch.runtime).await;
        // The caller may have stopped waiting.
        let _ = batch.done.send(());
    }
    debug!("remote command queue closed");
}
