//! Tube Reference Counting
//!
//! A tube channel multiplexes independently opened sub-tubes. The parent
//! channel stays open while at least one sub-tube is open and is closed once,
//! when the last one goes away.

use std::collections::BTreeSet;

use switchboard_traits::TubeType;

/// Open sub-tubes of one tube channel.
#[derive(Debug, Default)]
pub struct TubeRecord {
    open: BTreeSet<u32>,
    parent_closed: bool,
}

impl TubeRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an opened sub-tube. Returns `false` if it was already counted.
    pub fn opened(&mut self, tube_id: u32) -> bool {
        if self.parent_closed {
            return false;
        }
        self.open.insert(tube_id)
    }

    /// Record a closed sub-tube.
    ///
    /// Returns `true` exactly once: when the count drops from one to zero.
    /// Unknown ids are ignored.
    pub fn closed(&mut self, tube_id: u32) -> bool {
        if !self.open.remove(&tube_id) {
            return false;
        }
        if self.open.is_empty() && !self.parent_closed {
            self.parent_closed = true;
            return true;
        }
        false
    }

    pub fn count(&self) -> usize {
        self.open.len()
    }

    pub fn is_parent_closed(&self) -> bool {
        self.parent_closed
    }
}

/// Well-known name of the handler for a tube type and service.
///
/// Non-alphanumeric characters of the service become `_`.
pub fn handler_bus_name(namespace: &str, tube_type: TubeType, service: &str) -> String {
    let prefix = match tube_type {
        TubeType::DBus => "DTubeHandler",
        TubeType::Stream => "StreamTubeHandler",
    };
    let service: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{namespace}.{prefix}.{service}")
}

/// Object path of the handler derived from its bus name.
pub fn handler_object_path(bus_name: &str) -> String {
    format!("/{}", bus_name.replace('.', "/"))
}
