use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::PanelCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Idle,
    Armed(Instant),
}

impl Default for KeyState {
    fn default() -> Self {
        KeyState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    /// First press (or first after the window lapsed); waiting for a second.
    Armed,
    Fire,
}

/// Double-press detector, one state per command.
///
/// A second press within `window` of the arming press fires and resets the
/// key. A second press after the window is treated as a new first press.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    keys: HashMap<PanelCommand, KeyState>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            keys: HashMap::new(),
        }
    }

    pub fn state(&self, command: PanelCommand) -> KeyState {
        self.keys.get(&command).copied().unwrap_or_default()
    }

    pub fn press(&mut self, command: PanelCommand, now: Instant) -> PressOutcome {
        match self.state(command) {
            KeyState::Armed(armed_at) if now.saturating_duration_since(armed_at) <= self.window => {
                self.keys.insert(command, KeyState::Idle);
                PressOutcome::Fire
            }
            _ => {
                self.keys.insert(command, KeyState::Armed(now));
                PressOutcome::Armed
            }
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(1000);

    #[test]
    fn single_press_never_fires() {
        let mut debouncer = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(debouncer.press(PanelCommand::Skip, t0), PressOutcome::Armed);
        assert_eq!(debouncer.state(PanelCommand::Skip), KeyState::Armed(t0));
    }

    #[test]
    fn two_presses_within_window_fire_once() {
        let mut debouncer = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        debouncer.press(PanelCommand::Submit, t0);
        assert_eq!(
            debouncer.press(PanelCommand::Submit, t0 + Duration::from_millis(400)),
            PressOutcome::Fire
        );
        assert_eq!(debouncer.state(PanelCommand::Submit), KeyState::Idle);

        // A third press starts over.
        assert_eq!(
            debouncer.press(PanelCommand::Submit, t0 + Duration::from_millis(600)),
            PressOutcome::Armed
        );
    }

    #[test]
    fn press_exactly_at_window_edge_fires() {
        let mut debouncer = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        debouncer.press(PanelCommand::Select, t0);
        assert_eq!(debouncer.press(PanelCommand::Select, t0 + WINDOW), PressOutcome::Fire);
    }

    #[test]
    fn presses_further_apart_than_window_rearm() {
        let mut debouncer = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        let late = t0 + WINDOW + Duration::from_millis(1);
        debouncer.press(PanelCommand::Extract, t0);
        assert_eq!(debouncer.press(PanelCommand::Extract, late), PressOutcome::Armed);
        assert_eq!(debouncer.state(PanelCommand::Extract), KeyState::Armed(late));
        assert_eq!(
            debouncer.press(PanelCommand::Extract, late + Duration::from_millis(10)),
            PressOutcome::Fire
        );
    }

    #[test]
    fn keys_are_independent() {
        let mut debouncer = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        debouncer.press(PanelCommand::Skip, t0);
        assert_eq!(
            debouncer.press(PanelCommand::Select, t0 + Duration::from_millis(100)),
            PressOutcome::Armed
        );
        assert_eq!(
            debouncer.press(PanelCommand::Skip, t0 + Duration::from_millis(200)),
            PressOutcome::Fire
        );
    }

    #[test]
    fn clear_forgets_armed_keys() {
        let mut debouncer = Debouncer::new(WINDOW);
        let t0 = Instant::now();
        debouncer.press(PanelCommand::DeleteSlot, t0);
        debouncer.clear();
        assert_eq!(
            debouncer.press(PanelCommand::DeleteSlot, t0 + Duration::from_millis(100)),
            PressOutcome::Armed
        );
    }
}
