use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one conversation's exclusive execution slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app: String,
    pub user: String,
    pub conversation_id: String,
}

impl SessionKey {
    pub fn new(
        app: impl Into<String>,
        user: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app, self.user, self.conversation_id)
    }
}
