use crate::{config::ControlConfig, types::TemperatureSample};

/// Side effects requested by the engine. The caller applies them in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    ActuatorOn,
    ActuatorOff,
    IndicatorOn,
    IndicatorOff,
    HoldFan,
    ResumeProgram,
    SpawnEvaluator,
}

impl ControlAction {
    pub fn is_remote(self) -> bool {
        matches!(self, Self::HoldFan | Self::ResumeProgram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Loop was stopped; the evaluator must return.
    Exit,
    Wait,
    Evaluate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlState {
    pub loop_active: bool,
    pub force_refresh: bool,
    pub override_target: Option<i32>,
    pub fan_hold_active: bool,
    pub actuator_on: bool,
}

#[derive(Debug, Clone)]
pub struct ControlEngine {
    pub config: ControlConfig,
    state: ControlState,
    evaluator_alive: bool,
    last_check_ms: Option<u64>,
    last_differential: Option<i32>,
}

impl ControlEngine {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            state: ControlState::default(),
            evaluator_alive: false,
            last_check_ms: None,
            last_differential: None,
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn is_evaluator_alive(&self) -> bool {
        self.evaluator_alive
    }

    pub fn last_differential(&self) -> Option<i32> {
        self.last_differential
    }

    pub fn start_loop(&mut self) -> Vec<ControlAction> {
        let mut actions = Vec::new();

        if !self.state.loop_active {
            self.state.loop_active = true;
            self.state.force_refresh = true;
            actions.push(ControlAction::IndicatorOn);
        }

        // A stopped evaluator may still be alive until its next tick; it picks the loop back up.
        if !self.evaluator_alive {
            self.evaluator_alive = true;
            actions.push(ControlAction::SpawnEvaluator);
        }

        actions
    }

    pub fn stop_loop(&mut self) -> Vec<ControlAction> {
        if !self.state.loop_active {
            return Vec::new();
        }
        self.state.loop_active = false;
        vec![ControlAction::IndicatorOff]
    }

    pub fn set_override(&mut self, target: i32) -> bool {
        let changed = self.state.override_target != Some(target);
        self.state.override_target = Some(target);
        self.state.force_refresh = true;
        changed
    }

    pub fn clear_override(&mut self) -> bool {
        let changed = self.state.override_target.take().is_some();
        self.state.force_refresh = true;
        changed
    }

    pub fn request_refresh(&mut self) {
        self.state.force_refresh = true;
    }

    pub fn manual_on(&mut self) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        self.turn_actuator_on(&mut actions);
        actions
    }

    pub fn manual_off(&mut self) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        self.turn_actuator_off(&mut actions);
        actions
    }

    pub fn button_edge(&mut self) -> Vec<ControlAction> {
        if self.state.loop_active {
            let mut actions = self.stop_loop();
            actions.extend(self.manual_off());
            actions
        } else {
            self.start_loop()
        }
    }

    /// Called by the evaluator once per tick.
    pub fn tick(&mut self, now_ms: u64) -> TickDecision {
        if !self.state.loop_active {
            self.evaluator_alive = false;
            return TickDecision::Exit;
        }

        let due = self
            .last_check_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.check_interval_ms)
            .unwrap_or(true);

        if due || self.state.force_refresh {
            TickDecision::Evaluate
        } else {
            TickDecision::Wait
        }
    }

    /// The evaluator ended without going through `tick`, e.g. after it panicked. The loop
    /// is stopped rather than left active with nothing evaluating it.
    pub fn evaluator_lost(&mut self) -> Vec<ControlAction> {
        self.evaluator_alive = false;
        self.stop_loop()
    }

    pub fn differential(&self, sample: TemperatureSample) -> i32 {
        let setpoint = self.state.override_target.unwrap_or(sample.desired);
        sample.actual - setpoint
    }

    pub fn evaluate(&mut self, sample: TemperatureSample, now_ms: u64) -> Vec<ControlAction> {
        let mut actions = Vec::new();
        let differential = self.differential(sample);
        self.last_differential = Some(differential);

        if self.state.loop_active {
            let threshold = self.config.threshold;
            if self.state.actuator_on && differential > threshold {
                self.turn_actuator_off(&mut actions);
            } else if !self.state.actuator_on && differential < -threshold {
                self.turn_actuator_on(&mut actions);
            }
        }

        self.finish_check(now_ms);
        actions
    }

    /// Records a failed evaluation so the next attempt waits for the full interval.
    pub fn skip_evaluation(&mut self, now_ms: u64) {
        self.finish_check(now_ms);
    }

    /// Rolls the fan hold flag back when the remote command did not go through.
    pub fn remote_action_failed(&mut self, action: ControlAction) {
        match action {
            ControlAction::HoldFan => self.state.fan_hold_active = false,
            ControlAction::ResumeProgram => self.state.fan_hold_active = true,
            _ => {}
        }
    }

    pub fn shutdown(&mut self) -> Vec<ControlAction> {
        let mut actions = self.stop_loop();
        self.state.force_refresh = false;
        self.turn_actuator_off(&mut actions);
        actions
    }

    fn finish_check(&mut self, now_ms: u64) {
        self.state.force_refresh = false;
        self.last_check_ms = Some(now_ms);
    }

    fn turn_actuator_on(&mut self, actions: &mut Vec<ControlAction>) {
        if !self.state.actuator_on {
            self.state.actuator_on = true;
            actions.push(ControlAction::ActuatorOn);
        }
        if !self.state.fan_hold_active {
            self.state.fan_hold_active = true;
            actions.push(ControlAction::HoldFan);
        }
    }

    fn turn_actuator_off(&mut self, actions: &mut Vec<ControlAction>) {
        if self.state.actuator_on {
            self.state.actuator_on = false;
            actions.push(ControlAction::ActuatorOff);
        }
        if self.state.fan_hold_active {
            self.state.fan_hold_active = false;
            actions.push(ControlAction::ResumeProgram);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn active_engine() -> ControlEngine {
        let mut engine = ControlEngine::new(ControlConfig::default());
        engine.start_loop();
        engine
    }

    fn sample(actual: i32, desired: i32) -> TemperatureSample {
        TemperatureSample { actual, desired }
    }

    #[test]
    fn start_loop_twice_spawns_one_evaluator() {
        let mut engine = ControlEngine::new(ControlConfig::default());

        assert_eq!(
            engine.start_loop(),
            vec![ControlAction::IndicatorOn, ControlAction::SpawnEvaluator]
        );
        assert!(engine.start_loop().is_empty());
        assert!(engine.is_evaluator_alive());
    }

    #[test]
    fn restart_before_exit_reuses_live_evaluator() {
        let mut engine = active_engine();
        engine.stop_loop();

        // The evaluator has not ticked yet, so it is still alive.
        assert_eq!(engine.start_loop(), vec![ControlAction::IndicatorOn]);
        assert_eq!(engine.tick(0), TickDecision::Evaluate);
    }

    #[test]
    fn stop_loop_exits_evaluator_on_next_tick() {
        let mut engine = active_engine();

        assert_eq!(engine.stop_loop(), vec![ControlAction::IndicatorOff]);
        assert!(engine.stop_loop().is_empty());
        assert_eq!(engine.tick(1_000), TickDecision::Exit);
        assert!(!engine.is_evaluator_alive());

        assert_eq!(
            engine.start_loop(),
            vec![ControlAction::IndicatorOn, ControlAction::SpawnEvaluator]
        );
    }

    #[test]
    fn tick_waits_for_check_interval() {
        let mut engine = active_engine();
        assert_eq!(engine.tick(0), TickDecision::Evaluate);
        engine.evaluate(sample(680, 680), 0);

        assert_eq!(engine.tick(179_999), TickDecision::Wait);
        assert_eq!(engine.tick(180_000), TickDecision::Evaluate);
    }

    #[test]
    fn override_forces_immediate_evaluation() {
        let mut engine = active_engine();
        engine.evaluate(sample(680, 680), 0);
        assert_eq!(engine.tick(1_000), TickDecision::Wait);

        assert!(engine.set_override(700));
        assert_eq!(engine.tick(2_000), TickDecision::Evaluate);

        engine.evaluate(sample(680, 680), 2_000);
        assert!(!engine.state().force_refresh);
        assert_eq!(engine.tick(3_000), TickDecision::Wait);
    }

    #[test]
    fn differential_at_band_edge_changes_nothing() {
        let mut engine = active_engine();
        engine.manual_on();

        assert!(engine.evaluate(sample(70, 68), 0).is_empty());
        assert!(engine.state().actuator_on);

        engine.manual_off();
        assert!(engine.evaluate(sample(66, 68), 1).is_empty());
        assert!(!engine.state().actuator_on);
    }

    #[test]
    fn above_band_turns_actuator_off() {
        let mut engine = active_engine();
        engine.manual_on();

        let actions = engine.evaluate(sample(72, 68), 0);

        assert_eq!(
            actions,
            vec![ControlAction::ActuatorOff, ControlAction::ResumeProgram]
        );
        assert!(!engine.state().actuator_on);
        assert!(!engine.state().fan_hold_active);
    }

    #[test]
    fn below_band_turns_actuator_on() {
        let mut engine = active_engine();

        let actions = engine.evaluate(sample(65, 68), 0);

        assert_eq!(actions, vec![ControlAction::ActuatorOn, ControlAction::HoldFan]);
        assert!(engine.state().actuator_on);
        assert!(engine.state().fan_hold_active);
    }

    #[test]
    fn inactive_loop_never_actuates() {
        let mut engine = ControlEngine::new(ControlConfig::default());
        engine.request_refresh();

        assert!(engine.evaluate(sample(600, 700), 0).is_empty());
        assert!(!engine.state().force_refresh);
    }

    #[test]
    fn override_takes_precedence_over_remote_setpoint() {
        let mut engine = active_engine();
        engine.set_override(60);

        assert_eq!(engine.differential(sample(65, 68)), 5);
        assert!(engine.evaluate(sample(65, 68), 0).is_empty());
        assert_eq!(engine.last_differential(), Some(5));

        engine.clear_override();
        assert_eq!(engine.differential(sample(65, 68)), -3);
    }

    #[test]
    fn manual_on_when_already_on_is_noop() {
        let mut engine = ControlEngine::new(ControlConfig::default());

        assert_eq!(
            engine.manual_on(),
            vec![ControlAction::ActuatorOn, ControlAction::HoldFan]
        );
        assert!(engine.manual_on().is_empty());
        assert!(!engine.state().loop_active);
    }

    #[test]
    fn button_toggles_loop_and_turns_off() {
        let mut engine = ControlEngine::new(ControlConfig::default());

        assert_eq!(
            engine.button_edge(),
            vec![ControlAction::IndicatorOn, ControlAction::SpawnEvaluator]
        );
        engine.evaluate(sample(60, 68), 0);
        assert!(engine.state().actuator_on);

        assert_eq!(
            engine.button_edge(),
            vec![
                ControlAction::IndicatorOff,
                ControlAction::ActuatorOff,
                ControlAction::ResumeProgram
            ]
        );
        assert!(!engine.state().loop_active);
        assert!(!engine.state().actuator_on);
    }

    #[test]
    fn failed_hold_is_retried_on_next_manual_on() {
        let mut engine = ControlEngine::new(ControlConfig::default());
        engine.manual_on();
        engine.remote_action_failed(ControlAction::HoldFan);

        assert_eq!(engine.manual_on(), vec![ControlAction::HoldFan]);
    }

    #[test]
    fn skipped_evaluation_clears_refresh_and_waits() {
        let mut engine = active_engine();
        engine.skip_evaluation(5_000);

        assert!(!engine.state().force_refresh);
        assert_eq!(engine.tick(6_000), TickDecision::Wait);
        assert_eq!(engine.tick(185_000), TickDecision::Evaluate);
    }

    #[test]
    fn shutdown_turns_everything_off() {
        let mut engine = active_engine();
        engine.manual_on();

        assert_eq!(
            engine.shutdown(),
            vec![
                ControlAction::IndicatorOff,
                ControlAction::ActuatorOff,
                ControlAction::ResumeProgram
            ]
        );
        assert_eq!(engine.state(), &ControlState::default());
    }

    #[test]
    fn lost_evaluator_stops_loop() {
        let mut engine = active_engine();

        assert_eq!(engine.evaluator_lost(), vec![ControlAction::IndicatorOff]);
        assert!(!engine.state().loop_active);
        assert!(!engine.is_evaluator_alive());
        assert_eq!(
            engine.start_loop(),
            vec![ControlAction::IndicatorOn, ControlAction::SpawnEvaluator]
        );
    }
}
