//! Shared device session.
//!
//! One `DeviceSession` owns everything that used to be process-wide: the open
//! controller (with its pin cache and active pump), the "a protocol is
//! running" flag and the collaborators that get told about it. Clones are
//! cheap handles onto the same session, so the execution engine and the
//! initiating side see the same state under the same lock.

use crate::config::Settings;
use crate::error::{AppResult, KataraError};
use crate::hardware::adapter::{SerialAdapter, SerialLink};
use crate::hardware::controller::{PinRange, ValveController};
use crate::hardware::pump::{check_rate_cycles, Pump, PumpDirection};
use crate::observer::{Notifier, Renderer, TracingNotifier, TracingRenderer};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info};

/// Rejection for a second concurrent protocol run.
pub const RUN_IN_PROGRESS: &str = "There is already a protocol running! Please either wait for \
                                   it to finish or cancel it before running another protocol.";

/// Rejection for a protocol run while a pump is cycling.
pub const PUMP_IN_PROGRESS: &str = "You cannot start a protocol while a pump is running.";

struct SessionInner {
    settings: Settings,
    controller: Mutex<Option<ValveController>>,
    protocol_running: AtomicBool,
    pump_generation: AtomicU64,
    renderer: Arc<dyn Renderer>,
    notifier: Arc<dyn Notifier>,
}

/// Handle onto the shared device state.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field(
                "protocol_running",
                &self.inner.protocol_running.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

/// Held by the execution engine for the lifetime of a run.
///
/// Dropping it clears the session's "protocol running" flag.
#[derive(Debug)]
pub struct RunGuard {
    session: DeviceSession,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.session
            .inner
            .protocol_running
            .store(false, Ordering::SeqCst);
        debug!("run slot released");
    }
}

/// What a manual pump request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualPump {
    /// The pump started cycling.
    Started(Pump),
    /// The same pump was already cycling and was stopped instead.
    Stopped(Pump),
}

impl DeviceSession {
    /// Create a session with explicit collaborators. No device is connected yet.
    pub fn new(
        settings: Settings,
        renderer: Arc<dyn Renderer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                settings,
                controller: Mutex::new(None),
                protocol_running: AtomicBool::new(false),
                pump_generation: AtomicU64::new(0),
                renderer,
                notifier,
            }),
        }
    }

    /// Create a session that reports through `tracing`.
    pub fn with_tracing(settings: Settings) -> Self {
        Self::new(settings, Arc::new(TracingRenderer), Arc::new(TracingNotifier))
    }

    /// Loaded settings.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Addressable pins.
    pub fn pin_range(&self) -> PinRange {
        PinRange::from_settings(&self.inner.settings.device)
    }

    /// Pause tick and cancellation poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.inner.settings.engine.poll_interval()
    }

    /// Render collaborator.
    pub fn renderer(&self) -> &dyn Renderer {
        self.inner.renderer.as_ref()
    }

    /// Notify collaborator.
    pub fn notifier(&self) -> &dyn Notifier {
        self.inner.notifier.as_ref()
    }

    /// Connect over `link`, replacing any previous connection.
    ///
    /// Rejected while a protocol or a pump is running.
    pub async fn connect(&self, link: Box<dyn SerialLink>) -> AppResult<()> {
        if self.is_protocol_running() {
            return Err(KataraError::Concurrency(
                "You cannot reconnect while a protocol is running.".to_string(),
            ));
        }
        let mut slot = self.inner.controller.lock().await;
        if let Some(old) = slot.as_mut() {
            if old.active_pump().is_some() {
                return Err(KataraError::Concurrency(
                    "You cannot reconnect while a pump is running.".to_string(),
                ));
            }
            old.close().await;
        }
        *slot = None;

        let controller = ValveController::connect(link, self.inner.settings.device.clone()).await?;
        for pin in controller.pin_range().iter() {
            self.renderer().on_pin_state_changed(pin, false);
        }
        *slot = Some(controller);
        Ok(())
    }

    /// Connect to a serial port by name.
    pub async fn connect_port(&self, port: &str) -> AppResult<()> {
        let adapter = SerialAdapter::new(port, self.inner.settings.device.baud_rate);
        self.connect(Box::new(adapter)).await
    }

    /// Close the connection, if any.
    pub async fn disconnect(&self) {
        if let Some(mut controller) = self.inner.controller.lock().await.take() {
            controller.close().await;
            info!("disconnected");
        }
    }

    /// True while a controller is connected and its link is open.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .controller
            .lock()
            .await
            .as_ref()
            .is_some_and(ValveController::is_open)
    }

    /// True while a protocol run holds the run slot.
    pub fn is_protocol_running(&self) -> bool {
        self.inner.protocol_running.load(Ordering::SeqCst)
    }

    /// Claim the single run slot.
    ///
    /// The controller lock is held while the connection and pump are checked
    /// and the slot is claimed, so a manual pump or toggle cannot slip in
    /// between.
    pub async fn begin_run(&self) -> AppResult<RunGuard> {
        let slot = self.inner.controller.lock().await;
        let controller = slot
            .as_ref()
            .filter(|c| c.is_open())
            .ok_or(KataraError::NotConnected)?;
        if controller.active_pump().is_some() {
            return Err(KataraError::Concurrency(PUMP_IN_PROGRESS.to_string()));
        }
        self.inner
            .protocol_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| KataraError::Concurrency(RUN_IN_PROGRESS.to_string()))?;
        debug!("run slot claimed");
        Ok(RunGuard {
            session: self.clone(),
        })
    }

    /// True while a pump is cycling.
    pub async fn pump_busy(&self) -> bool {
        self.inner
            .controller
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.active_pump().is_some())
    }

    /// Lock the connected controller.
    pub async fn lock(&self) -> AppResult<MappedMutexGuard<'_, ValveController>> {
        let guard = self.inner.controller.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| KataraError::NotConnected)
    }

    /// Turn a recovered connection warning into a notice and carry on.
    pub fn absorb_warning<T>(&self, result: AppResult<T>, fallback: T) -> AppResult<T> {
        match result {
            Err(KataraError::ConnectionWarning(message)) => {
                self.notifier().report_warning(&message);
                Ok(fallback)
            }
            other => other,
        }
    }

    /// Flip one valve by hand.
    ///
    /// Rejected while a protocol runs. A running pump is stopped first.
    pub async fn toggle_pin(&self, pin: i64) -> AppResult<bool> {
        const REJECTED: &str = "You cannot toggle valves while a protocol is running.";
        if self.is_protocol_running() {
            return Err(KataraError::Concurrency(REJECTED.to_string()));
        }
        let mut controller = self.lock().await?;
        if self.is_protocol_running() {
            return Err(KataraError::Concurrency(REJECTED.to_string()));
        }
        let pin = controller.check_pin(pin)?;
        self.halt_pump(&mut controller).await?;

        let target = !controller.pin_state(pin);
        let result = controller.toggle_pin(pin).await;
        let state = self.absorb_warning(result, target)?;
        self.renderer().on_pin_state_changed(pin, state);
        info!(pin, energized = state, "valve toggled");
        Ok(state)
    }

    /// Start a pump sequence by hand.
    ///
    /// Rejected while a protocol runs. A different running pump is stopped
    /// first; asking for the pump that is already running stops it instead.
    /// Finite sequences clear the busy marker on their own once done.
    pub async fn start_pump(
        &self,
        valves: [i64; 3],
        direction: PumpDirection,
        rate: i64,
        cycles: i64,
    ) -> AppResult<ManualPump> {
        const REJECTED: &str = "You cannot start a pump while a protocol is running.";
        if self.is_protocol_running() {
            return Err(KataraError::Concurrency(REJECTED.to_string()));
        }
        let run = check_rate_cycles(rate, cycles, true).map_err(KataraError::Device)?;
        let mut controller = self.lock().await?;
        // A run may have claimed the slot while this call waited for the lock.
        if self.is_protocol_running() {
            return Err(KataraError::Concurrency(REJECTED.to_string()));
        }
        let pump = controller.specify_pump(valves)?;

        if controller.active_pump() == Some(pump) {
            self.halt_pump(&mut controller).await?;
            return Ok(ManualPump::Stopped(pump));
        }
        self.halt_pump(&mut controller).await?;

        let result = controller.run_pump(pump, direction, run).await;
        self.absorb_warning(result, ())?;
        let generation = self.inner.pump_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.renderer().on_pump_state_changed(pump.valves(), true);
        drop(controller);

        if let Some(duration) = run.duration() {
            let session = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                session.expire_pump(pump, generation).await;
            });
        }
        Ok(ManualPump::Started(pump))
    }

    /// Stop a manually started pump.
    pub async fn stop_pump(&self) -> AppResult<()> {
        let mut controller = self.lock().await?;
        self.halt_pump(&mut controller).await
    }

    async fn halt_pump(&self, controller: &mut ValveController) -> AppResult<()> {
        let Some(pump) = controller.active_pump() else {
            return Ok(());
        };
        self.inner.pump_generation.fetch_add(1, Ordering::SeqCst);
        let result = controller.stop_pump().await;
        self.render_pump_stopped(pump);
        self.absorb_warning(result, ())
    }

    async fn expire_pump(&self, pump: Pump, generation: u64) {
        if self.inner.pump_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Ok(mut controller) = self.lock().await {
            if controller.active_pump() == Some(pump) {
                controller.finish_pump(pump);
                self.render_pump_stopped(pump);
            }
        }
    }

    /// Tell the renderer a pump's valves are idle again.
    pub fn render_pump_stopped(&self, pump: Pump) {
        self.renderer().on_pump_state_changed(pump.valves(), false);
        for valve in pump.valves() {
            self.renderer().on_pin_state_changed(valve, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLink;
    use crate::observer::RecordingObserver;

    fn quick_settings() -> Settings {
        let mut settings = Settings::default();
        settings.device.reset_delay_ms = 0;
        settings
    }

    async fn connected() -> (DeviceSession, MockLink, RecordingObserver) {
        let observer = RecordingObserver::new();
        let session = DeviceSession::new(
            quick_settings(),
            Arc::new(observer.clone()),
            Arc::new(observer.clone()),
        );
        let link = MockLink::new();
        session.connect(Box::new(link.clone())).await.unwrap();
        link.clear_frames();
        observer.clear();
        (session, link, observer)
    }

    #[tokio::test]
    async fn test_not_connected() {
        let session = DeviceSession::with_tracing(quick_settings());
        assert!(!session.is_connected().await);
        assert!(matches!(
            session.toggle_pin(5).await,
            Err(KataraError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_single_run_slot() {
        let (session, _, _) = connected().await;
        let guard = session.begin_run().await.unwrap();
        assert!(session.is_protocol_running());
        assert!(matches!(
            session.begin_run().await,
            Err(KataraError::Concurrency(_))
        ));
        drop(guard);
        assert!(!session.is_protocol_running());
        assert!(session.begin_run().await.is_ok());
    }

    #[tokio::test]
    async fn test_run_slot_needs_connection_and_idle_pump() {
        let session = DeviceSession::with_tracing(quick_settings());
        assert!(matches!(
            session.begin_run().await,
            Err(KataraError::NotConnected)
        ));

        let (session, _, _) = connected().await;
        session
            .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
            .await
            .unwrap();
        assert!(matches!(
            session.begin_run().await,
            Err(KataraError::Concurrency(_))
        ));
        assert!(!session.is_protocol_running());
    }

    #[tokio::test]
    async fn test_manual_pump_waiting_on_lock_loses_to_claimed_run() {
        let (session, link, _) = connected().await;
        let held = session.lock().await.unwrap();

        let pump = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
                    .await
            }
        });
        tokio::task::yield_now().await;
        // Claim the slot the way a run would if it got in first.
        session
            .inner
            .protocol_running
            .store(true, Ordering::SeqCst);
        drop(held);

        assert!(matches!(
            pump.await.unwrap(),
            Err(KataraError::Concurrency(_))
        ));
        assert!(!session.pump_busy().await);
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn test_run_waiting_on_lock_loses_to_manual_pump() {
        let (session, _, _) = connected().await;
        let held = session.lock().await.unwrap();

        let pump = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
                    .await
            }
        });
        tokio::task::yield_now().await;
        let run = tokio::spawn({
            let session = session.clone();
            async move { session.begin_run().await }
        });
        tokio::task::yield_now().await;
        drop(held);

        assert!(matches!(pump.await.unwrap(), Ok(ManualPump::Started(_))));
        assert!(matches!(
            run.await.unwrap(),
            Err(KataraError::Concurrency(_))
        ));
        assert!(session.pump_busy().await);
        assert!(!session.is_protocol_running());
    }

    #[tokio::test]
    async fn test_toggle_rejected_while_protocol_runs() {
        let (session, link, _) = connected().await;
        let _guard = session.begin_run().await.unwrap();
        assert!(matches!(
            session.toggle_pin(5).await,
            Err(KataraError::Concurrency(_))
        ));
        assert!(link.frames().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_stops_running_pump_first() {
        let (session, link, _) = connected().await;
        session
            .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
            .await
            .unwrap();
        assert!(session.pump_busy().await);

        assert!(session.toggle_pin(9).await.unwrap());
        assert!(!session.pump_busy().await);
        let frames = link.frames();
        assert_eq!(frames[1..], ["c".to_string(), "0091c".to_string()]);
    }

    #[tokio::test]
    async fn test_toggle_reports_recovered_warning() {
        let (session, link, observer) = connected().await;
        link.fail_next_writes(1);
        assert!(session.toggle_pin(9).await.unwrap());
        assert_eq!(observer.warnings().len(), 1);
        assert!(session.lock().await.unwrap().pin_state(9));
    }

    #[tokio::test]
    async fn test_same_pump_twice_stops_it() {
        let (session, _, _) = connected().await;
        let first = session
            .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
            .await
            .unwrap();
        assert!(matches!(first, ManualPump::Started(_)));
        let second = session
            .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
            .await
            .unwrap();
        assert!(matches!(second, ManualPump::Stopped(_)));
        assert!(!session.pump_busy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_manual_pump_clears_itself() {
        let (session, _, observer) = connected().await;
        session
            .start_pump([4, 5, 6], PumpDirection::Reverse, 10, 20)
            .await
            .unwrap();
        assert!(session.pump_busy().await);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(!session.pump_busy().await);
        assert!(observer
            .events()
            .contains(&crate::observer::ObservedEvent::Pump([4, 5, 6], false)));
    }

    #[tokio::test]
    async fn test_reconnect_rejected_while_pump_runs() {
        let (session, _, _) = connected().await;
        session
            .start_pump([4, 5, 6], PumpDirection::Forward, 10, -1)
            .await
            .unwrap();
        let err = session
            .connect(Box::new(MockLink::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, KataraError::Concurrency(_)));
    }

    #[tokio::test]
    async fn test_rejects_invalid_manual_pump() {
        let (session, _, _) = connected().await;
        assert!(session
            .start_pump([4, 4, 6], PumpDirection::Forward, 10, 5)
            .await
            .is_err());
        assert!(session
            .start_pump([4, 5, 6], PumpDirection::Forward, 1000, 5)
            .await
            .is_err());
    }
}
