//! Scenario files replayed by `switchboard simulate`.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use switchboard_core::loopback::{
    LoopbackChannel, LoopbackConnection, LoopbackTubeHandlers, StaticContacts,
};
use switchboard_traits::{ChannelKind, Contact, TargetHandle, TubeInfo, TubeState, TubeType};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default = "default_connection")]
    pub connection: String,
    #[serde(default)]
    pub contacts: Vec<ContactSpec>,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    #[serde(default)]
    pub requests: Vec<RequestSpec>,
    #[serde(default)]
    pub handlers: HandlerSpec,
}

fn default_connection() -> String {
    "loopback".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactSpec {
    pub id: String,
    pub handle: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSpec {
    pub path: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub handle: u32,
    #[serde(default = "default_true")]
    pub incoming: bool,
    /// Exists before the dispatcher attaches
    #[serde(default)]
    pub existing: bool,
    /// Messages received once the chat is observed
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub tubes: Vec<TubeSpec>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TubeSpec {
    pub id: u32,
    pub service: String,
    #[serde(rename = "type", default = "default_tube_type")]
    pub tube_type: TubeType,
    #[serde(default = "default_tube_state")]
    pub state: TubeState,
    #[serde(default)]
    pub initiator: u32,
}

fn default_tube_type() -> TubeType {
    TubeType::DBus
}

fn default_tube_state() -> TubeState {
    TubeState::LocalPending
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSpec {
    pub kind: ChannelKind,
    pub handle: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandlerSpec {
    #[serde(default)]
    pub running: Vec<String>,
    #[serde(default)]
    pub activatable: Vec<String>,
}

/// Loopback objects built from a scenario.
pub struct World {
    pub connection: Arc<LoopbackConnection>,
    pub contacts: StaticContacts,
    pub handlers: LoopbackTubeHandlers,
    /// Channels to announce after the backlog was drained, in file order
    pub live: Vec<Arc<LoopbackChannel>>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let scenario: Scenario = toml::from_str(&content)
            .with_context(|| format!("Invalid scenario {}", path.display()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<()> {
        let mut paths = HashSet::new();
        for channel in &self.channels {
            if !paths.insert(channel.path.as_str()) {
                bail!("Duplicate channel path {}", channel.path);
            }
            if !channel.tubes.is_empty() && channel.kind != ChannelKind::Tube {
                bail!("Channel {} has tubes but is not a tube channel", channel.path);
            }
        }
        Ok(())
    }

    pub fn build(&self) -> World {
        let contacts = StaticContacts::new();
        for contact in &self.contacts {
            let mut resolved = Contact::new(&contact.id, contact.handle);
            resolved.name = contact.name.clone();
            contacts.insert(resolved);
        }

        let handlers = self
            .handlers
            .running
            .iter()
            .fold(LoopbackTubeHandlers::new(), |handlers, name| {
                handlers.with_running(name)
            });
        let handlers = self
            .handlers
            .activatable
            .iter()
            .fold(handlers, |handlers, name| handlers.with_activatable(name));

        let connection = LoopbackConnection::new(&self.connection);
        let mut live = Vec::new();
        for spec in &self.channels {
            let channel = LoopbackChannel::new(
                &spec.path,
                spec.kind,
                TargetHandle::contact(spec.handle),
                !spec.incoming,
            );
            for tube in &spec.tubes {
                channel.add_tube(TubeInfo {
                    id: tube.id,
                    initiator: tube.initiator,
                    tube_type: tube.tube_type,
                    service: tube.service.clone(),
                    state: tube.state,
                });
            }
            if spec.existing {
                connection.add_existing(channel);
            } else {
                live.push(channel);
            }
        }

        World {
            connection,
            contacts,
            handlers,
            live,
        }
    }

    pub fn messages_for(&self, path: &str) -> &[String] {
        self.channels
            .iter()
            .find(|channel| channel.path == path)
            .map(|channel| channel.messages.as_slice())
            .unwrap_or_default()
    }
}
