//! Button panel: an ordered set of named, run-only protocols.

use crate::error::{AppResult, KataraError};
use crate::protocol::codec::{decode_routine, encode_routine, PANEL_MARKER, PROTOCOL_MARKER};
use crate::protocol::{file_stem, NodePath, Protocol};
use crate::session::DeviceSession;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

/// Protocols that can be started with one click.
#[derive(Debug, Default)]
pub struct ProtocolPanel {
    protocols: Vec<Protocol>,
}

impl ProtocolPanel {
    /// Empty panel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a protocol. Names must be unique; the protocol becomes read-only.
    pub fn add(&mut self, mut protocol: Protocol) -> AppResult<()> {
        if self.get(protocol.name()).is_some() {
            return Err(KataraError::invalid(
                &NodePath::root(),
                format!(
                    "There is already a protocol named '{}' in the panel.",
                    protocol.name()
                ),
            ));
        }
        protocol.set_writable(false);
        self.protocols.push(protocol);
        Ok(())
    }

    /// Remove a protocol by name. Rejected while it runs.
    pub fn remove(&mut self, name: &str) -> AppResult<Option<Protocol>> {
        let Some(index) = self.protocols.iter().position(|p| p.name() == name) else {
            return Ok(None);
        };
        if self.protocols[index].is_running() {
            return Err(KataraError::Concurrency(format!(
                "You cannot remove '{name}' while it is running."
            )));
        }
        Ok(Some(self.protocols.remove(index)))
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<&Protocol> {
        self.protocols.iter().find(|p| p.name() == name)
    }

    /// Look up by name, mutably (to run it).
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Protocol> {
        self.protocols.iter_mut().find(|p| p.name() == name)
    }

    /// Names in panel order.
    pub fn names(&self) -> Vec<&str> {
        self.protocols.iter().map(Protocol::name).collect()
    }

    /// Number of protocols.
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// True if the panel has no protocols.
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// `["This is a saved Button Panel", [name, nodes...], ...]`
    pub fn encode(&self) -> Value {
        let mut items = vec![Value::from(PANEL_MARKER)];
        items.extend(self.protocols.iter().map(|protocol| {
            let mut entry = vec![Value::from(protocol.name())];
            entry.extend(encode_routine(protocol.actions()));
            Value::Array(entry)
        }));
        Value::Array(items)
    }

    /// Decode a saved panel, or a single saved protocol named `fallback_name`.
    pub fn decode(value: &Value, fallback_name: &str) -> AppResult<Self> {
        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
        let mut panel = Self::new();
        match items {
            [marker, entries @ ..] if marker.as_str() == Some(PANEL_MARKER) => {
                for entry in entries {
                    panel.add(decode_entry(entry)?)?;
                }
            }
            [marker, nodes @ ..] if marker.as_str() == Some(PROTOCOL_MARKER) => {
                panel.add(Protocol::with_actions(fallback_name, decode_routine(nodes)?))?;
            }
            _ => {
                return Err(KataraError::Persistence(
                    "This file is not a saved button panel or protocol.".to_string(),
                ))
            }
        }
        Ok(panel)
    }

    /// Validate every protocol, then write the panel as pretty-printed JSON.
    ///
    /// Nothing is written if any protocol is empty or invalid.
    pub fn save_to_path(&mut self, session: &DeviceSession, path: &Path) -> AppResult<()> {
        for protocol in &mut self.protocols {
            if protocol.actions().is_empty() {
                return Err(KataraError::invalid(
                    &NodePath::root(),
                    format!("There are no steps in the protocol '{}'.", protocol.name()),
                ));
            }
            if let Err(err) = protocol.validate(session) {
                warn!(protocol = protocol.name(), error = %err, "panel not saved");
                return Err(err);
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.encode())?)?;
        info!(path = %path.display(), protocols = self.len(), "panel saved");
        Ok(())
    }

    /// Read a panel (or a single protocol) from disk.
    ///
    /// Rejected while any protocol is running on `session`.
    pub fn load_from_path(path: &Path, session: &DeviceSession) -> AppResult<Self> {
        if session.is_protocol_running() {
            return Err(KataraError::Concurrency(
                "You cannot load a button panel while a protocol is running.".to_string(),
            ));
        }
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let panel = Self::decode(&value, &file_stem(path))?;
        info!(path = %path.display(), protocols = panel.len(), "panel loaded");
        Ok(panel)
    }
}

fn decode_entry(entry: &Value) -> AppResult<Protocol> {
    match entry.as_array().map(Vec::as_slice) {
        Some([name, nodes @ ..]) => {
            let name = name.as_str().ok_or_else(|| {
                KataraError::Persistence(format!("{name} is not a valid protocol name."))
            })?;
            Ok(Protocol::with_actions(name, decode_routine(nodes)?))
        }
        _ => Err(KataraError::Persistence(format!(
            "{entry} is not a saved panel entry."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_protocol;
    use crate::protocol::{Action, Loop, Step};
    use serde_json::json;

    fn rinse() -> Protocol {
        Protocol::with_actions(
            "rinse",
            vec![
                Step::set_valves("5", "1").into(),
                Loop::new("2")
                    .with_children(vec![Step::pause("1").into()])
                    .into(),
            ],
        )
    }

    #[test]
    fn test_names_are_unique_and_protocols_read_only() {
        let mut panel = ProtocolPanel::new();
        panel.add(rinse()).unwrap();
        assert!(panel.add(rinse()).is_err());
        assert_eq!(panel.names(), ["rinse"]);
        assert!(!panel.get("rinse").unwrap().is_writable());
    }

    #[test]
    fn test_round_trip() {
        let mut panel = ProtocolPanel::new();
        panel.add(rinse()).unwrap();
        panel
            .add(Protocol::with_actions("flush", vec![Step::pause("3").into()]))
            .unwrap();

        let saved = panel.encode();
        assert_eq!(saved[0], json!(PANEL_MARKER));
        assert_eq!(saved[2], json!(["flush", ["PauseStep", "3"]]));

        let loaded = ProtocolPanel::decode(&saved, "unused").unwrap();
        assert_eq!(loaded.names(), ["rinse", "flush"]);
        assert_eq!(loaded.get("rinse").unwrap().actions(), rinse().actions());
    }

    #[test]
    fn test_single_protocol_file_is_accepted() {
        let saved = encode_protocol(&[Action::from(Step::pause("1"))]);
        let panel = ProtocolPanel::decode(&saved, "warmup").unwrap();
        assert_eq!(panel.names(), ["warmup"]);
    }

    #[test]
    fn test_rejects_other_json() {
        assert!(ProtocolPanel::decode(&json!({"a": 1}), "x").is_err());
        assert!(ProtocolPanel::decode(&json!([PANEL_MARKER, 5]), "x").is_err());
    }

    #[test]
    fn test_remove() {
        let mut panel = ProtocolPanel::new();
        panel.add(rinse()).unwrap();
        assert!(panel.remove("nope").unwrap().is_none());
        assert!(panel.remove("rinse").unwrap().is_some());
        assert!(panel.is_empty());
    }
}
