//! Common data types for Audio Arcade components.

use crate::error::InvalidIdError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length in bytes of a channel name or participant identity.
pub const MAX_ID_LEN: usize = 128;

fn validate_id(raw: &str) -> Result<(), InvalidIdError> {
    if raw.trim().is_empty() {
        return Err(InvalidIdError::Empty);
    }
    if raw.len() > MAX_ID_LEN {
        return Err(InvalidIdError::TooLong { max: MAX_ID_LEN });
    }
    if raw.chars().any(char::is_control) {
        return Err(InvalidIdError::ControlCharacters);
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Wrap a trusted value without validation.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Validate and wrap an untrusted value.
            ///
            /// # Errors
            ///
            /// Returns `InvalidIdError` if the value is empty, too long, or
            /// contains control characters.
            pub fn parse(value: impl Into<String>) -> Result<Self, InvalidIdError> {
                let value = value.into();
                validate_id(&value)?;
                Ok(Self(value))
            }

            /// Borrow the underlying string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidIdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Opaque channel name. A channel exists while it has members.
    ChannelId
);

string_id!(
    /// Opaque, pre-validated participant identity.
    ParticipantId
);

/// Label of a named resource attachment.
///
/// At most one attachment of each label may exist per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachmentLabel {
    /// The exclusive broadcast slot arbitrated by the channel.
    #[serde(rename = "aux")]
    Primary,
    /// The single-occupant collaborator slot gated by the holder.
    #[serde(rename = "collab")]
    Secondary,
}

impl AttachmentLabel {
    /// Returns the wire name of the label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AttachmentLabel::Primary => "aux",
            AttachmentLabel::Secondary => "collab",
        }
    }

    /// Parse a published track name into a label.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aux" => Some(AttachmentLabel::Primary),
            "collab" => Some(AttachmentLabel::Secondary),
            _ => None,
        }
    }
}

impl fmt::Display for AttachmentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
