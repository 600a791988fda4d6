use serde::{Deserialize, Serialize};

use crate::protocol::Author;
use crate::types::UserId;

/// The authenticated user as reported by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: UserId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub verified: bool,
}

impl Principal {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            avatar_ref: None,
            verified: true,
        }
    }

    /// Sender attributes to stamp on outgoing messages.
    pub fn author(&self) -> Author {
        Author {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }
}

/// Source of the current user. Sign-in itself happens elsewhere.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<Principal>;
}

/// Identity provider with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    principal: Option<Principal>,
}

impl StaticIdentity {
    pub fn signed_in(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
        }
    }

    pub fn signed_out() -> Self {
        Self { principal: None }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<Principal> {
        self.principal.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_identity() {
        let sam = Principal::new("sam", "Sam");
        assert_eq!(StaticIdentity::signed_in(sam.clone()).current_user(), Some(sam));
        assert!(StaticIdentity::signed_out().current_user().is_none());
    }

    #[test]
    fn test_author_copies_display_attributes() {
        let mut sam = Principal::new("sam", "Sam");
        sam.avatar_ref = Some("avatars/sam.png".into());
        let author = sam.author();
        assert_eq!(author.id, UserId::new("sam"));
        assert_eq!(author.avatar_ref.as_deref(), Some("avatars/sam.png"));
    }
}
