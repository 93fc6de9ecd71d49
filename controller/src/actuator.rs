use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use fireplace_common::PinConfig;
use tracing::{debug, info};

use crate::error::{FireplaceError, Result};

const BUTTON_DEBOUNCE: Duration = Duration::from_millis(200);

pub type ButtonHandler = Box<dyn Fn() + Send + Sync>;

/// Relay, indicator lamp and push button.
///
/// Setters are idempotent: asking for the current state performs no physical write.
pub trait Actuator: Send + Sync {
    fn set_actuator(&self, on: bool) -> Result<()>;
    fn set_indicator(&self, on: bool) -> Result<()>;
    fn is_actuator_on(&self) -> bool;
    fn is_indicator_on(&self) -> bool;
    /// The handler runs on the button's context and must not block.
    fn register_button_edge_handler(&self, handler: ButtonHandler) -> Result<()>;
    /// Forces both outputs off and releases the pins.
    fn shutdown(&self) -> Result<()>;
}

struct Pins {
    fireplace: bool,
    indicator: bool,
    released: bool,
    last_press: Option<Instant>,
}

/// In-memory GPIO used on hosts without the relay board attached.
pub struct SimulatedActuator {
    pins: PinConfig,
    state: Mutex<Pins>,
    handler: Mutex<Option<Arc<ButtonHandler>>>,
    debounce: Duration,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl SimulatedActuator {
    pub fn new(pins: PinConfig) -> Self {
        Self::with_debounce(pins, BUTTON_DEBOUNCE)
    }

    pub fn with_debounce(pins: PinConfig, debounce: Duration) -> Self {
        info!(
            fireplace = pins.fireplace_pin,
            indicator = pins.indicator_pin,
            button = pins.button_pin,
            "GPIO test mode, outputs are simulated"
        );
        Self {
            pins,
            state: Mutex::new(Pins {
                fireplace: false,
                indicator: false,
                released: false,
                last_press: None,
            }),
            handler: Mutex::new(None),
            debounce,
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Physical writes performed so far.
    #[cfg(test)]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following physical write fail, as a dead GPIO chip would.
    #[cfg(test)]
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulates a falling edge on the button pin. Returns whether the edge was delivered.
    pub fn press_button(&self) -> bool {
        let now = Instant::now();
        {
            let mut state = self.lock_state();
            if state.released {
                return false;
            }
            if let Some(last) = state.last_press {
                if now.duration_since(last) < self.debounce {
                    debug!("button edge within debounce window, ignored");
                    return false;
                }
            }
            state.last_press = Some(now);
        }

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, Pins> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, pin: u8, label: &str, level: bool) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FireplaceError::Hardware(format!(
                "write to {label} pin {pin} failed"
            )));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        info!(pin, "{label} {}", if level { "HIGH" } else { "LOW" });
        Ok(())
    }
}

impl Actuator for SimulatedActuator {
    fn set_actuator(&self, on: bool) -> Result<()> {
        let mut state = self.lock_state();
        if state.released {
            return Err(FireplaceError::Hardware("fireplace pin released".into()));
        }
        if state.fireplace == on {
            return Ok(());
        }
        self.write(self.pins.fireplace_pin, "fireplace", on)?;
        state.fireplace = on;
        Ok(())
    }

    fn set_indicator(&self, on: bool) -> Result<()> {
        let mut state = self.lock_state();
        if state.released {
            return Err(FireplaceError::Hardware("indicator pin released".into()));
        }
        if state.indicator == on {
            return Ok(());
        }
        self.write(self.pins.indicator_pin, "indicator", on)?;
        state.indicator = on;
        Ok(())
    }

    fn is_actuator_on(&self) -> bool {
        self.lock_state().fireplace
    }

    fn is_indicator_on(&self) -> bool {
        self.lock_state().indicator
    }

    fn register_button_edge_handler(&self, handler: ButtonHandler) -> Result<()> {
        if self.lock_state().released {
            return Err(FireplaceError::Hardware("button pin released".into()));
        }
        *self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));
        info!(pin = self.pins.button_pin, "button edge handler registered");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.released {
            return Ok(());
        }

        // Both outputs are driven low even if the first write fails.
        let fireplace = self.write(self.pins.fireplace_pin, "fireplace", false);
        let indicator = self.write(self.pins.indicator_pin, "indicator", false);
        state.fireplace = false;
        state.indicator = false;
        state.released = true;
        drop(state);

        self.handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        info!("GPIO released");
        fireplace.and(indicator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins() -> PinConfig {
        PinConfig {
            fireplace_pin: 17,
            indicator_pin: 27,
            button_pin: 22,
        }
    }

    #[test]
    fn setters_are_idempotent() {
        let actuator = SimulatedActuator::new(pins());

        actuator.set_actuator(true).unwrap();
        actuator.set_actuator(true).unwrap();
        actuator.set_indicator(false).unwrap();

        assert!(actuator.is_actuator_on());
        assert!(!actuator.is_indicator_on());
        assert_eq!(actuator.write_count(), 1);
    }

    #[test]
    fn shutdown_forces_outputs_off_and_releases() {
        let actuator = SimulatedActuator::new(pins());
        actuator.set_actuator(true).unwrap();
        actuator.set_indicator(true).unwrap();

        actuator.shutdown().unwrap();

        assert!(!actuator.is_actuator_on());
        assert!(!actuator.is_indicator_on());
        assert!(actuator.set_actuator(true).is_err());
        assert!(actuator.shutdown().is_ok());
    }

    #[test]
    fn failed_write_leaves_state_unchanged() {
        let actuator = SimulatedActuator::new(pins());
        actuator.fail_writes(true);

        assert!(matches!(
            actuator.set_actuator(true),
            Err(FireplaceError::Hardware(_))
        ));
        assert!(!actuator.is_actuator_on());
    }

    #[test]
    fn button_presses_are_debounced() {
        let actuator = SimulatedActuator::with_debounce(pins(), Duration::from_secs(60));
        let presses = Arc::new(AtomicUsize::new(0));
        let counter = presses.clone();
        actuator
            .register_button_edge_handler(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(actuator.press_button());
        assert!(!actuator.press_button());
        assert_eq!(presses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn press_without_handler_is_dropped() {
        let actuator = SimulatedActuator::with_debounce(pins(), Duration::ZERO);

        assert!(!actuator.press_button());
    }
}
