use std::fmt;

use thiserror::Error;

/// Call identifier. Either the PBX-native id of the primary channel or the
/// carrier correlation id (e.g. a call SID) when one is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallIdError {
    #[error("CallId is empty")]
    Empty,
}

impl CallId {
    pub fn new(value: impl Into<String>) -> Result<Self, CallIdError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(CallIdError::Empty);
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

resource_id!(
    /// Control-plane channel handle.
    ChannelId
);
resource_id!(
    /// Control-plane bridge handle.
    BridgeId
);
resource_id!(
    /// Conversation record id owned by the conversation store.
    ConversationId
);

impl CallId {
    /// The native call id is the id of the primary channel.
    pub fn from_channel(channel: &ChannelId) -> Result<Self, CallIdError> {
        Self::new(channel.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_rejects_blank() {
        assert_eq!(CallId::new("   "), Err(CallIdError::Empty));
        assert_eq!(CallId::new("CH1").unwrap().as_str(), "CH1");
    }
}
