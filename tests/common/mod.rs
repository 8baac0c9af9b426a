//! Shared fixtures for integration tests.

#![allow(dead_code)]

use katara_control::config::Settings;
use katara_control::hardware::mock::MockLink;
use katara_control::observer::RecordingObserver;
use katara_control::session::DeviceSession;
use std::sync::Arc;

/// Defaults without the firmware reset delay.
pub fn quick_settings() -> Settings {
    let mut settings = Settings::default();
    settings.device.reset_delay_ms = 0;
    settings
}

/// Session connected to a fresh mock, with frames and events cleared.
pub async fn connected_session() -> (DeviceSession, MockLink, RecordingObserver) {
    let observer = RecordingObserver::new();
    let session = DeviceSession::new(
        quick_settings(),
        Arc::new(observer.clone()),
        Arc::new(observer.clone()),
    );
    let link = MockLink::new();
    session
        .connect(Box::new(link.clone()))
        .await
        .expect("mock connects");
    link.clear_frames();
    observer.clear();
    (session, link, observer)
}

/// Owned frame list for comparisons.
pub fn frames(list: &[&str]) -> Vec<String> {
    list.iter().map(|f| f.to_string()).collect()
}
