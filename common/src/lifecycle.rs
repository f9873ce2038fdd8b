use crate::{
    config::TimingConfig,
    types::{LifecycleMode, NodeStatus, RadioPowerState, Rgb},
};

/// Side effects requested by the engine. The platform runner executes them
/// in order and feeds outcomes back through the result mutators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAction {
    SetIndicator(Rgb),
    RadioOn,
    RadioOff,
    Delay(u64),
    /// Ask the backend whether this device is registered.
    CheckRegistration,
    /// Read one sensor sample and submit it to the backend.
    CollectAndUpload,
    /// Power the radio off, reinitialize the stack, and verify it comes
    /// back. The adapter reports success through `radio_reset_succeeded`
    /// and treats a failed reinit as a fatal condition.
    ResetRadio,
}

/// Top-level device state machine. Owns the lifecycle mode, the radio
/// on/off decision, and the two scheduled deadlines (registration re-check,
/// sensor upload).
///
/// The engine is pure: `tick` and the mutators return actions, the caller
/// performs I/O. All mutation happens at tick or event boundaries; no other
/// component changes lifecycle state.
#[derive(Debug, Clone)]
pub struct LifecycleEngine {
    pub config: TimingConfig,

    mode: LifecycleMode,
    /// Last registration state confirmed by the backend. Kept separate from
    /// `mode` so `Error` can resolve back to the right operating mode.
    registered: bool,
    radio: RadioPowerState,

    pairing_started_ms: Option<u64>,
    last_registration_check_ms: Option<u64>,
    last_upload_ms: Option<u64>,
    force_immediate_upload: bool,

    flash_until_ms: Option<u64>,
    last_indicator: Option<Rgb>,
    /// A stack reset is in flight or was never acknowledged; faults in
    /// the meantime must not request another one.
    radio_reset_attempted: bool,
}

impl LifecycleEngine {
    pub fn new(mut config: TimingConfig) -> Self {
        config.sanitize();
        Self {
            config,
            mode: LifecycleMode::Unregistered,
            registered: false,
            radio: RadioPowerState::Off,
            pairing_started_ms: None,
            last_registration_check_ms: None,
            last_upload_ms: None,
            force_immediate_upload: false,
            flash_until_ms: None,
            last_indicator: None,
            radio_reset_attempted: false,
        }
    }

    pub fn mode(&self) -> LifecycleMode {
        self.mode
    }

    pub fn registered(&self) -> bool {
        self.registered
    }

    pub fn radio(&self) -> RadioPowerState {
        self.radio
    }

    pub fn upload_pending(&self) -> bool {
        self.force_immediate_upload
    }

    /// One cooperative poll tick. Pairing and error modes short-circuit:
    /// pairing runs no registration or telemetry work (mutual exclusion
    /// with BLE traffic), error mode runs only already-scheduled deadlines.
    pub fn tick(&mut self, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        if self.mode == LifecycleMode::Pairing {
            self.push_indicator(&mut actions, Rgb::PAIRING);
            if self.pairing_expired(now_ms) {
                self.finish_pairing_window(&mut actions);
            }
            return actions;
        }

        if self.mode == LifecycleMode::Error {
            self.push_indicator(&mut actions, Rgb::ERROR);
            self.schedule_due_work(now_ms, &mut actions);
            return actions;
        }

        if self.registration_check_due(now_ms) {
            self.last_registration_check_ms = Some(now_ms);
            actions.push(NodeAction::CheckRegistration);
        }

        // A link accepted just before registration completed leaves the
        // radio up in Registered mode; force it down here.
        if self.mode == LifecycleMode::Registered && self.radio != RadioPowerState::Off {
            self.power_radio_off(&mut actions);
        }

        let color = self.display_color(now_ms);
        self.push_indicator(&mut actions, color);

        if self.mode == LifecycleMode::Registered && self.upload_due(now_ms) {
            self.start_upload(now_ms, &mut actions);
        }

        actions
    }

    /// External pairing signal (button hold). Ignored while already pairing
    /// or registered.
    pub fn pairing_requested(&mut self, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();

        let allowed = self.mode == LifecycleMode::Unregistered
            || (self.mode == LifecycleMode::Error && !self.registered);
        if !allowed {
            return actions;
        }

        self.mode = LifecycleMode::Pairing;
        self.pairing_started_ms = Some(now_ms);
        self.push_indicator(&mut actions, Rgb::PAIRING);
        if self.radio == RadioPowerState::Off {
            actions.push(NodeAction::RadioOn);
            self.radio = RadioPowerState::Advertising;
        }
        actions
    }

    /// The command processor observed a created-response to REGISTER.
    /// The emitted `Delay` gives the connected client time to receive the
    /// REGISTERED notification before the radio drops.
    pub fn registration_confirmed(&mut self, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        if self.mode != LifecycleMode::Pairing {
            return actions;
        }

        self.mode = LifecycleMode::Registered;
        self.registered = true;
        self.pairing_started_ms = None;
        self.force_immediate_upload = true;
        self.last_registration_check_ms = Some(now_ms);

        self.push_indicator(&mut actions, Rgb::OFF);
        actions.push(NodeAction::Delay(self.config.registration_grace_ms));
        self.power_radio_off(&mut actions);
        actions
    }

    /// REGISTER was rejected by the backend. The pairing window stays open
    /// and the radio stays on so the client can retry.
    pub fn registration_failed(&mut self, _now_ms: u64) -> Vec<NodeAction> {
        Vec::new()
    }

    /// Scheduled re-check answered. A successful backend round-trip clears
    /// error mode; the indicator changes only on an actual state change.
    pub fn registration_check_succeeded(
        &mut self,
        now_ms: u64,
        registered: bool,
    ) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        if self.mode == LifecycleMode::Pairing {
            return actions;
        }

        let was_registered = self.registered;
        self.registered = registered;

        let new_mode = if registered {
            LifecycleMode::Registered
        } else {
            LifecycleMode::Unregistered
        };

        if self.mode != new_mode {
            self.mode = new_mode;
            if registered && !was_registered {
                self.force_immediate_upload = true;
            }
            if registered && self.radio != RadioPowerState::Off {
                self.power_radio_off(&mut actions);
            }
            let color = self.display_color(now_ms);
            self.push_indicator(&mut actions, color);
        }
        actions
    }

    /// Re-check could not reach the backend. Deliberately keeps the
    /// previous confirmed state: a transient outage must not flap the mode
    /// between Registered and Error.
    pub fn registration_check_failed(&mut self, _now_ms: u64) -> Vec<NodeAction> {
        Vec::new()
    }

    pub fn upload_succeeded(&mut self, now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        // Restore the mode from the last confirmed registration state; a
        // re-check may have flipped it while the upload was in flight.
        self.mode = if self.registered {
            LifecycleMode::Registered
        } else {
            LifecycleMode::Unregistered
        };
        self.flash_until_ms = Some(now_ms.saturating_add(self.config.success_flash_ms));
        self.push_indicator(&mut actions, Rgb::SUCCESS);
        actions
    }

    /// Covers both a failed submit and a failed sensor read; no partial
    /// telemetry is ever sent.
    pub fn upload_failed(&mut self, _now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        self.mode = LifecycleMode::Error;
        self.push_indicator(&mut actions, Rgb::ERROR);
        actions
    }

    /// Unrecoverable radio fault from any state: error mode, radio forced
    /// off best-effort, and one full stack reset per fault episode. The
    /// adapter escalates a failed reset to a fatal condition.
    pub fn radio_fault(&mut self, _now_ms: u64) -> Vec<NodeAction> {
        let mut actions = Vec::new();
        self.mode = LifecycleMode::Error;
        self.pairing_started_ms = None;
        self.power_radio_off(&mut actions);
        if !self.radio_reset_attempted {
            self.radio_reset_attempted = true;
            actions.push(NodeAction::ResetRadio);
        }
        self.push_indicator(&mut actions, Rgb::ERROR);
        actions
    }

    /// The adapter completed a stack reset and left the radio off. Re-arms
    /// the reset attempt for the next fault episode.
    pub fn radio_reset_succeeded(&mut self) {
        self.radio_reset_attempted = false;
        self.radio = RadioPowerState::Off;
    }

    /// Adapter report of an executed radio transition or link change,
    /// applied at the event boundary.
    pub fn note_radio_state(&mut self, state: RadioPowerState) {
        self.radio = state;
    }

    pub fn status(&self, now_ms: u64) -> NodeStatus {
        NodeStatus {
            mode: self.mode.as_str(),
            registered: self.registered,
            radio: self.radio.as_str(),
            pairing_remaining_ms: self.pairing_remaining_ms(now_ms),
            next_registration_check_ms: self.next_deadline_ms(
                now_ms,
                self.last_registration_check_ms,
                self.registration_check_interval(),
            ),
            next_upload_ms: self.next_deadline_ms(
                now_ms,
                self.last_upload_ms,
                self.config.reading_interval_ms,
            ),
            upload_pending: self.force_immediate_upload,
        }
    }

    fn pairing_remaining_ms(&self, now_ms: u64) -> u64 {
        match self.pairing_started_ms {
            Some(start) => {
                let elapsed = now_ms.saturating_sub(start);
                self.config.pairing_timeout_ms.saturating_sub(elapsed)
            }
            None => 0,
        }
    }

    fn next_deadline_ms(&self, now_ms: u64, last: Option<u64>, interval: u64) -> u64 {
        match last {
            Some(last) => {
                let elapsed = now_ms.saturating_sub(last);
                interval.saturating_sub(elapsed)
            }
            None => 0,
        }
    }

    fn pairing_expired(&self, now_ms: u64) -> bool {
        self.pairing_started_ms
            .map(|start| now_ms.saturating_sub(start) >= self.config.pairing_timeout_ms)
            .unwrap_or(true)
    }

    /// Pairing window closed without confirmation: radio off
    /// unconditionally, even with a live link, to bound radio-on time.
    fn finish_pairing_window(&mut self, actions: &mut Vec<NodeAction>) {
        self.pairing_started_ms = None;
        self.mode = if self.registered {
            LifecycleMode::Registered
        } else {
            LifecycleMode::Unregistered
        };
        self.power_radio_off(actions);
        let color = self.mode_color();
        self.push_indicator(actions, color);
    }

    fn schedule_due_work(&mut self, now_ms: u64, actions: &mut Vec<NodeAction>) {
        if self.registration_check_due(now_ms) {
            self.last_registration_check_ms = Some(now_ms);
            actions.push(NodeAction::CheckRegistration);
        }
        if self.registered && self.upload_due(now_ms) {
            self.start_upload(now_ms, actions);
        }
    }

    fn start_upload(&mut self, now_ms: u64, actions: &mut Vec<NodeAction>) {
        // Stamp the deadline up front so a failure waits out a full
        // interval instead of retrying every tick.
        self.last_upload_ms = Some(now_ms);
        self.force_immediate_upload = false;
        actions.push(NodeAction::CollectAndUpload);
    }

    fn registration_check_interval(&self) -> u64 {
        if self.registered {
            self.config.registration_check_registered_ms
        } else {
            self.config.registration_check_unregistered_ms
        }
    }

    fn registration_check_due(&self, now_ms: u64) -> bool {
        match self.last_registration_check_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.registration_check_interval(),
            None => true,
        }
    }

    fn upload_due(&self, now_ms: u64) -> bool {
        if self.force_immediate_upload {
            return true;
        }
        self.last_upload_ms
            .map(|last| now_ms.saturating_sub(last) >= self.config.reading_interval_ms)
            .unwrap_or(false)
    }

    fn mode_color(&self) -> Rgb {
        match self.mode {
            LifecycleMode::Unregistered => Rgb::UNREGISTERED,
            LifecycleMode::Pairing => Rgb::PAIRING,
            LifecycleMode::Registered => Rgb::OFF,
            LifecycleMode::Error => Rgb::ERROR,
        }
    }

    fn display_color(&self, now_ms: u64) -> Rgb {
        let flashing = self
            .flash_until_ms
            .map(|until| now_ms < until)
            .unwrap_or(false);
        if flashing {
            Rgb::SUCCESS
        } else {
            self.mode_color()
        }
    }

    fn power_radio_off(&mut self, actions: &mut Vec<NodeAction>) {
        if self.radio != RadioPowerState::Off {
            actions.push(NodeAction::RadioOff);
            self.radio = RadioPowerState::Off;
        }
    }

    fn push_indicator(&mut self, actions: &mut Vec<NodeAction>, color: Rgb) {
        if self.last_indicator != Some(color) {
            actions.push(NodeAction::SetIndicator(color));
            self.last_indicator = Some(color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine() -> LifecycleEngine {
        LifecycleEngine::new(TimingConfig::default())
    }

    fn has_action(actions: &[NodeAction], wanted: &NodeAction) -> bool {
        actions.iter().any(|action| action == wanted)
    }

    #[test]
    fn boot_tick_checks_registration_and_shows_unregistered() {
        let mut engine = engine();
        let actions = engine.tick(0);

        assert!(has_action(&actions, &NodeAction::CheckRegistration));
        assert!(has_action(
            &actions,
            &NodeAction::SetIndicator(Rgb::UNREGISTERED)
        ));
        assert_eq!(engine.mode(), LifecycleMode::Unregistered);
    }

    #[test]
    fn indicator_only_changes_on_transitions() {
        let mut engine = engine();
        let first = engine.tick(0);
        assert!(has_action(
            &first,
            &NodeAction::SetIndicator(Rgb::UNREGISTERED)
        ));

        for tick in 1..50_u64 {
            let actions = engine.tick(tick * 100);
            assert!(
                !actions
                    .iter()
                    .any(|action| matches!(action, NodeAction::SetIndicator(_))),
                "indicator flickered at tick {tick}: {actions:?}"
            );
        }
    }

    #[test]
    fn recheck_interval_is_fast_while_unregistered() {
        let mut engine = engine();
        let _ = engine.tick(0);

        let actions = engine.tick(9_900);
        assert!(!has_action(&actions, &NodeAction::CheckRegistration));

        let actions = engine.tick(10_000);
        assert!(has_action(&actions, &NodeAction::CheckRegistration));
    }

    #[test]
    fn recheck_interval_is_slow_while_registered() {
        let mut engine = engine();
        let _ = engine.tick(0);
        let _ = engine.registration_check_succeeded(0, true);
        // Drain the immediate upload scheduled by discovery.
        let _ = engine.tick(100);

        let actions = engine.tick(10_100);
        assert!(!has_action(&actions, &NodeAction::CheckRegistration));

        let actions = engine.tick(300_000);
        assert!(has_action(&actions, &NodeAction::CheckRegistration));
    }

    #[test]
    fn pairing_request_turns_radio_on() {
        let mut engine = engine();
        let actions = engine.pairing_requested(1_000);

        assert_eq!(engine.mode(), LifecycleMode::Pairing);
        assert_eq!(engine.radio(), RadioPowerState::Advertising);
        assert!(has_action(&actions, &NodeAction::RadioOn));
        assert!(has_action(&actions, &NodeAction::SetIndicator(Rgb::PAIRING)));
    }

    #[test]
    fn pairing_request_ignored_while_pairing_or_registered() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        assert!(engine.pairing_requested(100).is_empty());

        let mut engine = self::engine();
        let _ = engine.registration_check_succeeded(0, true);
        assert!(engine.pairing_requested(100).is_empty());
        assert_eq!(engine.mode(), LifecycleMode::Registered);
    }

    #[test]
    fn pairing_suspends_registration_and_upload_work() {
        let mut engine = engine();
        let _ = engine.tick(0);
        let _ = engine.pairing_requested(100);

        // Well past both deadlines; pairing must still run neither.
        let actions = engine.tick(700_000);
        assert!(!has_action(&actions, &NodeAction::CheckRegistration));
        assert!(!has_action(&actions, &NodeAction::CollectAndUpload));
    }

    #[test]
    fn registration_confirmed_powers_off_after_grace() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        engine.note_radio_state(RadioPowerState::Connected);

        let actions = engine.registration_confirmed(5_000);

        assert_eq!(
            actions,
            vec![
                NodeAction::SetIndicator(Rgb::OFF),
                NodeAction::Delay(500),
                NodeAction::RadioOff,
            ]
        );
        assert_eq!(engine.mode(), LifecycleMode::Registered);
        assert_eq!(engine.radio(), RadioPowerState::Off);
        assert!(engine.upload_pending());
    }

    #[test]
    fn registration_confirmed_fires_at_most_once() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        let first = engine.registration_confirmed(1_000);
        assert!(!first.is_empty());

        let second = engine.registration_confirmed(1_100);
        assert!(second.is_empty());
        assert_eq!(engine.mode(), LifecycleMode::Registered);
    }

    #[test]
    fn immediate_upload_follows_registration() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        let _ = engine.registration_confirmed(5_000);

        // Scenario A: the upload goes out on the next tick, well before the
        // regular interval boundary.
        let actions = engine.tick(5_100);
        assert!(has_action(&actions, &NodeAction::CollectAndUpload));
        assert!(!engine.upload_pending());
    }

    #[test]
    fn failed_register_keeps_pairing_open() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        let _ = engine.registration_failed(2_000);

        assert_eq!(engine.mode(), LifecycleMode::Pairing);
        assert_eq!(engine.radio(), RadioPowerState::Advertising);
    }

    #[test]
    fn pairing_times_out_back_to_unregistered() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        engine.note_radio_state(RadioPowerState::Connected);

        let actions = engine.tick(119_900);
        assert!(!has_action(&actions, &NodeAction::RadioOff));

        // Scenario C: expiry tears the radio down even with a live link.
        let actions = engine.tick(120_000);
        assert!(has_action(&actions, &NodeAction::RadioOff));
        assert!(has_action(
            &actions,
            &NodeAction::SetIndicator(Rgb::UNREGISTERED)
        ));
        assert_eq!(engine.mode(), LifecycleMode::Unregistered);
        assert_eq!(engine.radio(), RadioPowerState::Off);
    }

    #[test]
    fn registered_mode_forces_radio_off() {
        let mut engine = engine();
        let _ = engine.registration_check_succeeded(0, true);
        // Link raced in before the lifecycle saw the confirmation.
        engine.note_radio_state(RadioPowerState::Connected);

        let actions = engine.tick(100);
        assert!(has_action(&actions, &NodeAction::RadioOff));
        assert_eq!(engine.radio(), RadioPowerState::Off);
    }

    #[test]
    fn check_discovering_registration_schedules_upload() {
        let mut engine = engine();
        let _ = engine.tick(0);
        let actions = engine.registration_check_succeeded(50, true);

        assert!(has_action(&actions, &NodeAction::SetIndicator(Rgb::OFF)));
        assert!(engine.upload_pending());

        // Second identical answer changes nothing; no indicator flicker.
        let _ = engine.tick(100);
        let actions = engine.registration_check_succeeded(200, true);
        assert!(actions.is_empty());
    }

    #[test]
    fn check_failure_keeps_previous_state() {
        let mut engine = engine();
        let _ = engine.registration_check_succeeded(0, true);
        let _ = engine.tick(100);

        let actions = engine.registration_check_failed(200);
        assert!(actions.is_empty());
        assert_eq!(engine.mode(), LifecycleMode::Registered);
        assert!(engine.registered());
    }

    #[test]
    fn upload_failure_enters_error_until_next_scheduled_success() {
        let mut engine = engine();
        let _ = engine.registration_check_succeeded(0, true);

        let actions = engine.tick(100);
        assert!(has_action(&actions, &NodeAction::CollectAndUpload));

        let actions = engine.upload_failed(200);
        assert!(has_action(&actions, &NodeAction::SetIndicator(Rgb::ERROR)));
        assert_eq!(engine.mode(), LifecycleMode::Error);

        // Scenario E: no immediate retry, the next attempt waits a full
        // interval from the failed one.
        let actions = engine.tick(1_000);
        assert!(!has_action(&actions, &NodeAction::CollectAndUpload));

        let actions = engine.tick(600_100);
        assert!(has_action(&actions, &NodeAction::CollectAndUpload));

        let actions = engine.upload_succeeded(600_200);
        assert!(has_action(&actions, &NodeAction::SetIndicator(Rgb::SUCCESS)));
        assert_eq!(engine.mode(), LifecycleMode::Registered);
    }

    #[test]
    fn success_flash_returns_to_off() {
        let mut engine = engine();
        let _ = engine.registration_check_succeeded(0, true);
        let _ = engine.tick(100);
        let _ = engine.upload_succeeded(200);

        // Flash still active.
        let actions = engine.tick(300);
        assert!(
            !actions
                .iter()
                .any(|action| matches!(action, NodeAction::SetIndicator(_)))
        );

        // Flash window over, back to off exactly once.
        let actions = engine.tick(700);
        assert!(has_action(&actions, &NodeAction::SetIndicator(Rgb::OFF)));
        let actions = engine.tick(800);
        assert!(
            !actions
                .iter()
                .any(|action| matches!(action, NodeAction::SetIndicator(_)))
        );
    }

    #[test]
    fn radio_stays_off_while_registered_after_every_tick() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        engine.note_radio_state(RadioPowerState::Connected);
        let _ = engine.registration_confirmed(1_000);

        for tick in 0..100_u64 {
            let now_ms = 1_100 + tick * 100;
            let _ = engine.tick(now_ms);
            if engine.mode() == LifecycleMode::Registered {
                assert_eq!(engine.radio(), RadioPowerState::Off);
            }
        }
    }

    #[test]
    fn radio_off_is_idempotent() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);
        engine.note_radio_state(RadioPowerState::Connected);

        let first = engine.radio_fault(500);
        assert!(has_action(&first, &NodeAction::RadioOff));

        // Radio already off: no second RadioOff from any path.
        let second = engine.radio_fault(600);
        assert!(!has_action(&second, &NodeAction::RadioOff));
        let actions = engine.tick(700);
        assert!(!has_action(&actions, &NodeAction::RadioOff));
    }

    #[test]
    fn radio_fault_escalates_to_error_and_forces_off() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);

        let actions = engine.radio_fault(500);
        assert!(has_action(&actions, &NodeAction::RadioOff));
        assert!(has_action(&actions, &NodeAction::SetIndicator(Rgb::ERROR)));
        assert_eq!(engine.mode(), LifecycleMode::Error);
        assert_eq!(engine.radio(), RadioPowerState::Off);

        // Error with no confirmed registration still allows a new pairing
        // attempt.
        let actions = engine.pairing_requested(1_000);
        assert!(has_action(&actions, &NodeAction::RadioOn));
    }

    #[test]
    fn radio_fault_requests_one_stack_reset_per_episode() {
        let mut engine = engine();
        let _ = engine.pairing_requested(0);

        let actions = engine.radio_fault(500);
        assert!(has_action(&actions, &NodeAction::ResetRadio));

        // Reset outcome not yet reported: no second reset request.
        let actions = engine.radio_fault(600);
        assert!(!has_action(&actions, &NodeAction::ResetRadio));

        // A completed reset re-arms the attempt for the next fault.
        engine.radio_reset_succeeded();
        let actions = engine.radio_fault(700);
        assert!(has_action(&actions, &NodeAction::ResetRadio));
    }

    #[test]
    fn upload_success_respects_latest_registration_state() {
        let mut engine = engine();
        let _ = engine.registration_check_succeeded(0, true);
        let actions = engine.tick(100);
        assert!(has_action(&actions, &NodeAction::CollectAndUpload));

        // Backend dropped the device while the upload was in flight.
        let _ = engine.registration_check_succeeded(150, false);

        let _ = engine.upload_succeeded(200);
        assert_eq!(engine.mode(), LifecycleMode::Unregistered);
        assert!(!engine.registered());
    }

    #[test]
    fn status_snapshot_reports_deadlines() {
        let mut engine = engine();
        let _ = engine.tick(0);
        let status = engine.status(4_000);

        assert_eq!(status.mode, "UNREGISTERED");
        assert_eq!(status.next_registration_check_ms, 6_000);
        assert!(!status.upload_pending);
    }
}
