use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;

/// A resolved remote contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub handle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Contact {
    pub fn new(id: impl Into<String>, handle: u32) -> Self {
        Self {
            id: id.into(),
            handle,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name shown to the user, falling back to the contact id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Resolves connection handles to contacts.
#[async_trait]
pub trait ContactResolver: Send + Sync {
    async fn lookup(&self, connection: &ConnectionId, handle: u32) -> Option<Contact>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_id() {
        let contact = Contact::new("bob@example.org", 7);
        assert_eq!(contact.display_name(), "bob@example.org");
        assert_eq!(contact.with_name("Bob").display_name(), "Bob");
    }
}
