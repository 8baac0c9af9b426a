//! Device protocol client for the KATARA valve controller.
//!
//! `ValveController` owns the link, the pin-state cache and the reference to
//! the pump that is currently cycling. Every frame goes through [`send`],
//! which on a failed write resets the link, checks the firmware identity,
//! replays every energized pin and resends the failed frame once. A reset
//! that succeeds surfaces as [`KataraError::ConnectionWarning`]; one that
//! fails surfaces as [`KataraError::ConnectionFatal`] and closes the link.
//!
//! [`send`]: ValveController::send

use crate::config::DeviceSettings;
use crate::error::{AppResult, KataraError, CONNECTION_RESTORED, LINK_LOST};
use crate::hardware::adapter::SerialLink;
use crate::hardware::command::DeviceCommand;
use crate::hardware::pump::{Pump, PumpDirection, PumpRun};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Inclusive range of addressable pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRange {
    /// Lowest pin
    pub min: u8,
    /// Highest pin
    pub max: u8,
}

impl PinRange {
    /// Range configured in the device settings.
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        Self {
            min: settings.min_pin,
            max: settings.max_pin,
        }
    }

    /// True if `pin` is addressable.
    pub fn contains(&self, pin: i64) -> bool {
        (i64::from(self.min)..=i64::from(self.max)).contains(&pin)
    }

    /// Narrow `pin` to a wire pin if it is addressable.
    pub fn checked(&self, pin: i64) -> Option<u8> {
        if self.contains(pin) {
            u8::try_from(pin).ok()
        } else {
            None
        }
    }

    /// Every addressable pin.
    pub fn iter(&self) -> impl Iterator<Item = u8> {
        self.min..=self.max
    }
}

impl Default for PinRange {
    fn default() -> Self {
        Self::from_settings(&DeviceSettings::default())
    }
}

impl fmt::Display for PinRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Client for one open controller.
pub struct ValveController {
    link: Box<dyn SerialLink>,
    settings: DeviceSettings,
    pins: PinRange,
    pin_states: BTreeMap<u8, bool>,
    active_pump: Option<Pump>,
}

impl fmt::Debug for ValveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValveController")
            .field("link", &self.link.name())
            .field("pins", &self.pins)
            .field("active_pump", &self.active_pump)
            .finish_non_exhaustive()
    }
}

impl ValveController {
    /// Open `link` and verify the firmware identity.
    ///
    /// Every pin starts out de-energized in the cache.
    pub async fn connect(
        mut link: Box<dyn SerialLink>,
        settings: DeviceSettings,
    ) -> AppResult<Self> {
        info!(link = link.name(), "connecting to valve controller");
        link.open()
            .await
            .map_err(|e| KataraError::ConnectionFatal(format!("{LINK_LOST} ({e:#})")))?;

        let pins = PinRange::from_settings(&settings);
        let mut controller = Self {
            link,
            settings,
            pins,
            pin_states: pins.iter().map(|pin| (pin, false)).collect(),
            active_pump: None,
        };
        if let Err(err) = controller.test_connection().await {
            controller.close().await;
            return Err(err);
        }
        info!(link = controller.link.name(), "valve controller connected");
        Ok(controller)
    }

    /// Perform the handshake and compare the identity line.
    ///
    /// The firmware resets whenever the port opens, so this first waits for
    /// the configured reset delay.
    pub async fn test_connection(&mut self) -> AppResult<()> {
        tokio::time::sleep(self.settings.reset_delay()).await;
        self.link
            .write(&DeviceCommand::Handshake.encode())
            .await
            .map_err(|e| KataraError::ConnectionFatal(format!("{LINK_LOST} ({e:#})")))?;
        let response = self
            .link
            .read_line(self.settings.handshake_timeout())
            .await
            .map_err(|e| KataraError::ConnectionFatal(format!("{LINK_LOST} ({e:#})")))?;

        match response {
            Some(identity) if identity == self.settings.firmware_signature => {
                debug!(identity = %identity, "handshake ok");
                Ok(())
            }
            other => Err(KataraError::ConnectionFatal(format!(
                "The device is not an Arduino running the KATARA firmware (got {:?}).",
                other.unwrap_or_default()
            ))),
        }
    }

    /// Addressable pins.
    pub fn pin_range(&self) -> PinRange {
        self.pins
    }

    /// Reject pins outside the addressable range.
    pub fn check_pin(&self, pin: i64) -> AppResult<u8> {
        self.pins.checked(pin).ok_or_else(|| {
            KataraError::Device(format!(
                "{pin} is not a valid pin. The available pins are numbered {}.",
                self.pins
            ))
        })
    }

    /// Cached state of `pin`.
    pub fn pin_state(&self, pin: u8) -> bool {
        self.pin_states.get(&pin).copied().unwrap_or(false)
    }

    /// The whole pin cache.
    pub fn pin_states(&self) -> &BTreeMap<u8, bool> {
        &self.pin_states
    }

    /// Pins currently recorded as energized.
    pub fn energized_pins(&self) -> Vec<u8> {
        self.pin_states
            .iter()
            .filter_map(|(pin, on)| on.then_some(*pin))
            .collect()
    }

    /// Pump currently cycling, if any.
    pub fn active_pump(&self) -> Option<Pump> {
        self.active_pump
    }

    /// True while the link is open.
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Drive several pins with one frame.
    ///
    /// The cache is updated once the frame reached the device, including
    /// after a recovered connection warning.
    pub async fn set_pins(&mut self, pins: &[(u8, bool)]) -> AppResult<()> {
        let mut seen = HashSet::new();
        for (pin, _) in pins {
            self.check_pin(i64::from(*pin))?;
            if !seen.insert(*pin) {
                return Err(KataraError::Device(format!(
                    "There is a duplicate pin entry ({pin})."
                )));
            }
        }
        let result = self.send(&DeviceCommand::SetPins(pins.to_vec())).await;
        if delivered(&result) {
            for (pin, state) in pins {
                self.pin_states.insert(*pin, *state);
            }
        }
        result
    }

    /// Drive a single pin.
    pub async fn set_pin(&mut self, pin: u8, state: bool) -> AppResult<()> {
        self.check_pin(i64::from(pin))?;
        let result = self.send(&DeviceCommand::SetPin { pin, state }).await;
        if delivered(&result) {
            self.pin_states.insert(pin, state);
        }
        result
    }

    /// Flip a pin; returns the new state.
    pub async fn toggle_pin(&mut self, pin: u8) -> AppResult<bool> {
        let state = !self.pin_state(pin);
        self.set_pin(pin, state).await?;
        Ok(state)
    }

    /// Build a pump from three pins.
    pub fn specify_pump(&self, valves: [i64; 3]) -> AppResult<Pump> {
        let mut checked = [0u8; 3];
        for (slot, valve) in checked.iter_mut().zip(valves) {
            *slot = self.check_pin(valve)?;
        }
        Pump::new(checked).map_err(KataraError::Device)
    }

    /// Start a pump sequence. A pump that is already cycling is stopped first.
    ///
    /// The firmware de-energizes the pump valves when the sequence ends, so
    /// the cache records them as off right away. A recovered link while
    /// stopping does not prevent the start; the warning is returned after it.
    pub async fn run_pump(
        &mut self,
        pump: Pump,
        direction: PumpDirection,
        run: PumpRun,
    ) -> AppResult<()> {
        let stopped = if self.active_pump.is_some() {
            self.stop_pump().await
        } else {
            Ok(())
        };
        if !delivered(&stopped) {
            return stopped;
        }
        let command = DeviceCommand::RunPump {
            direction,
            valves: pump.valves(),
            rate: run.rate,
            cycles: run.cycles,
        };
        let result = self.send(&command).await;
        if delivered(&result) {
            for valve in pump.valves() {
                self.pin_states.insert(valve, false);
            }
            self.active_pump = Some(pump);
            self.drain().await;
            info!(%pump, rate = run.rate, cycles = run.cycles, "pump started");
        }
        result.and(stopped)
    }

    /// Stop whatever sequence is running.
    pub async fn stop_pump(&mut self) -> AppResult<()> {
        let stopped = self.active_pump.take();
        let result = self.send(&DeviceCommand::Stop).await;
        if let Some(pump) = stopped {
            info!(%pump, "pump stopped");
        }
        result
    }

    /// Forget `pump` after its sequence completed on its own.
    pub fn finish_pump(&mut self, pump: Pump) {
        if self.active_pump == Some(pump) {
            self.active_pump = None;
            debug!(%pump, "pump finished");
        }
    }

    /// Close the link.
    pub async fn close(&mut self) {
        if let Err(err) = self.link.close().await {
            warn!(error = %err, "error while closing link");
        }
    }

    /// Write one frame, recovering the link once if the write fails.
    pub async fn send(&mut self, command: &DeviceCommand) -> AppResult<()> {
        let frame = command.encode();
        match self.link.write(&frame).await {
            Ok(()) => {
                debug!(frame = %frame, "frame written");
                self.read_ack().await;
                Ok(())
            }
            Err(err) => {
                warn!(frame = %frame, error = %err, "write failed, resetting connection");
                if let Err(fatal) = self.recover(&frame).await {
                    self.close().await;
                    error!(error = %fatal, "could not restore connection");
                    return Err(fatal);
                }
                warn!("connection restored and valve states replayed");
                Err(KataraError::ConnectionWarning(CONNECTION_RESTORED.to_string()))
            }
        }
    }

    /// Reopen, handshake, replay energized pins, resend `frame`.
    async fn recover(&mut self, frame: &str) -> AppResult<()> {
        let lost = |e: anyhow::Error| KataraError::ConnectionFatal(format!("{LINK_LOST} ({e:#})"));

        self.close().await;
        self.link.open().await.map_err(lost)?;
        self.test_connection().await?;

        for pin in self.energized_pins() {
            let replay = DeviceCommand::SetPin { pin, state: true }.encode();
            self.link.write(&replay).await.map_err(lost)?;
            self.read_ack().await;
        }

        self.link.write(frame).await.map_err(lost)?;
        self.read_ack().await;
        Ok(())
    }

    async fn read_ack(&mut self) -> Option<String> {
        match self.link.read_line(self.settings.read_timeout()).await {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to read device response");
                None
            }
        }
    }

    async fn drain(&mut self) {
        while self.read_ack().await.is_some() {}
    }
}

fn delivered(result: &AppResult<()>) -> bool {
    matches!(result, Ok(()) | Err(KataraError::ConnectionWarning(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLink;
    use crate::hardware::pump::check_rate_cycles;

    fn quick_settings() -> DeviceSettings {
        DeviceSettings {
            reset_delay_ms: 0,
            ..DeviceSettings::default()
        }
    }

    async fn connected() -> (ValveController, MockLink) {
        let link = MockLink::new();
        let controller = ValveController::connect(Box::new(link.clone()), quick_settings())
            .await
            .unwrap();
        link.clear_frames();
        (controller, link)
    }

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let link = MockLink::new();
        let controller = ValveController::connect(Box::new(link.clone()), quick_settings())
            .await
            .unwrap();
        assert_eq!(link.frames(), vec!["1c".to_string()]);
        assert!(controller.energized_pins().is_empty());
        assert_eq!(controller.pin_states().len(), 68);
    }

    #[tokio::test]
    async fn test_wrong_firmware_is_fatal() {
        let link = MockLink::new().with_identity("Some other sketch");
        let err = ValveController::connect(Box::new(link.clone()), quick_settings())
            .await
            .unwrap_err();
        assert!(err.is_fatal_connection());
        assert!(!link.is_open());
    }

    #[tokio::test]
    async fn test_set_pins_updates_cache() {
        let (mut controller, link) = connected().await;
        controller.set_pins(&[(5, true), (12, false)]).await.unwrap();
        assert_eq!(link.frames(), vec!["2051120c".to_string()]);
        assert!(controller.pin_state(5));
        assert_eq!(controller.energized_pins(), vec![5]);
    }

    #[tokio::test]
    async fn test_set_pins_rejects_bad_input_without_writing() {
        let (mut controller, link) = connected().await;
        assert!(matches!(
            controller.set_pins(&[(5, true), (5, false)]).await,
            Err(KataraError::Device(_))
        ));
        assert!(matches!(
            controller.set_pins(&[(70, true)]).await,
            Err(KataraError::Device(_))
        ));
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_pin_uses_single_pin_frame() {
        let (mut controller, link) = connected().await;
        assert!(controller.toggle_pin(9).await.unwrap());
        assert!(!controller.toggle_pin(9).await.unwrap());
        assert_eq!(link.frames(), vec!["0091c".to_string(), "0090c".to_string()]);
    }

    #[tokio::test]
    async fn test_write_failure_recovers_once_and_warns() {
        let (mut controller, link) = connected().await;
        controller.set_pins(&[(3, true), (4, true)]).await.unwrap();
        link.clear_frames();

        link.fail_next_writes(1);
        let err = controller.set_pins(&[(8, true)]).await.unwrap_err();

        assert!(err.is_recoverable());
        assert_eq!(link.open_count(), 2);
        assert_eq!(
            link.frames(),
            vec![
                "1c".to_string(),
                "0031c".to_string(),
                "0041c".to_string(),
                "2081c".to_string()
            ]
        );
        assert!(controller.pin_state(8));
    }

    #[tokio::test]
    async fn test_failed_resend_is_fatal_without_second_retry() {
        let (mut controller, link) = connected().await;
        link.fail_frame("2081c", 2);
        let err = controller.set_pins(&[(8, true)]).await.unwrap_err();

        assert!(err.is_fatal_connection());
        assert_eq!(link.open_count(), 2);
        assert_eq!(link.frames(), vec!["1c".to_string()]);
        assert!(!controller.pin_state(8));
        assert!(!controller.is_open());
    }

    #[tokio::test]
    async fn test_failed_handshake_after_reopen_is_fatal() {
        let (mut controller, link) = connected().await;
        // The original write and the handshake after reopening both fail.
        link.fail_next_writes(2);
        let err = controller.set_pins(&[(8, true)]).await.unwrap_err();

        assert!(err.is_fatal_connection());
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_failure_is_fatal() {
        let (mut controller, link) = connected().await;
        link.fail_next_writes(1);
        link.fail_next_opens(1);
        let err = controller.set_pin(6, true).await.unwrap_err();
        assert!(err.is_fatal_connection());
        assert_eq!(link.open_count(), 1);
    }

    #[tokio::test]
    async fn test_run_pump_clears_valves_and_tracks_pump() {
        let (mut controller, link) = connected().await;
        controller.set_pins(&[(4, true), (20, true)]).await.unwrap();
        link.clear_frames();

        let pump = controller.specify_pump([4, 5, 6]).unwrap();
        let run = check_rate_cycles(20, 150, false).unwrap();
        controller
            .run_pump(pump, PumpDirection::Forward, run)
            .await
            .unwrap();

        assert_eq!(link.frames(), vec!["3f004005006020000150c".to_string()]);
        assert!(!controller.pin_state(4));
        assert!(controller.pin_state(20));
        assert_eq!(controller.active_pump(), Some(pump));

        controller.finish_pump(pump);
        assert_eq!(controller.active_pump(), None);
    }

    #[tokio::test]
    async fn test_starting_a_pump_stops_the_running_one() {
        let (mut controller, link) = connected().await;
        let first = controller.specify_pump([4, 5, 6]).unwrap();
        let second = controller.specify_pump([7, 8, 9]).unwrap();
        let run = check_rate_cycles(10, 10, false).unwrap();
        controller
            .run_pump(first, PumpDirection::Forward, run)
            .await
            .unwrap();
        controller
            .run_pump(second, PumpDirection::Reverse, run)
            .await
            .unwrap();

        let frames = link.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], "c");
        assert!(frames[2].starts_with("3r007008009"));
        assert_eq!(controller.active_pump(), Some(second));
    }

    #[tokio::test]
    async fn test_recovered_stop_still_starts_next_pump() {
        let (mut controller, link) = connected().await;
        let first = controller.specify_pump([4, 5, 6]).unwrap();
        let second = controller.specify_pump([7, 8, 9]).unwrap();
        let run = check_rate_cycles(10, 10, false).unwrap();
        controller
            .run_pump(first, PumpDirection::Forward, run)
            .await
            .unwrap();
        link.clear_frames();

        link.fail_frame("c", 1);
        let err = controller
            .run_pump(second, PumpDirection::Reverse, run)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());

        let frames = link.frames();
        assert_eq!(frames[..2], ["1c".to_string(), "c".to_string()]);
        assert!(frames[2].starts_with("3r007008009"));
        assert_eq!(controller.active_pump(), Some(second));
    }

    #[test]
    fn test_pin_range() {
        let range = PinRange::default();
        assert_eq!(range.to_string(), "2-69");
        assert_eq!(range.checked(1), None);
        assert_eq!(range.checked(69), Some(69));
    }
}
