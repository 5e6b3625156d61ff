//! Opaque string identifiers carried by events and deliveries.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FieldViolation, ValidationFailure};

/// Identifier of record for an event (unique in the primary store).
///
/// Opaque: producers may send any non-empty string. Generated ids are UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

/// Token linking log lines and quarantine records of one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Generate a fresh identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = ValidationFailure;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ValidationFailure::SchemaViolation(vec![FieldViolation::new(
                        $name,
                        "must not be empty",
                    )]));
                }
                Ok(Self(s.to_string()))
            }
        }
    };
}

impl_string_newtype!(EventId, "event_id");
impl_string_newtype!(CorrelationId, "correlation_id");

/// Longest propagated correlation id kept, in bytes.
///
/// The id travels as the AMQP `correlation_id` property, a short string.
pub const MAX_CORRELATION_ID_LEN: usize = 255;

impl CorrelationId {
    /// Use the propagated value when present, non-blank and at most
    /// [`MAX_CORRELATION_ID_LEN`] bytes, otherwise generate one.
    pub fn from_header_or_generate(value: Option<&str>) -> Self {
        value
            .filter(|v| v.len() <= MAX_CORRELATION_ID_LEN)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(Self::generate)
    }
}
