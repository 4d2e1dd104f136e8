//! Macros for defining typed ID types.

/// Macro to define a typed UUID4 ID.
///
/// This generates a newtype wrapper around a UUID with:
/// - A `LABEL` constant used in error messages
/// - `new()` to generate a fresh random ID
/// - `parse()` to parse from string, accepting only version 4 UUIDs
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations (as a string)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(JobId, "job");
///
/// let job_id = JobId::new();
/// let parsed: JobId = "0c3c4b36-4e9d-4b7b-9f7e-1c0f3c5c2a11".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $label:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// Human readable label for this ID type.
            pub const LABEL: &'static str = $label;

            /// Creates a new random ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses an ID from a string.
            ///
            /// The string must be a hyphenated version 4 UUID.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let uuid = s
                    .parse::<$crate::Uuid>()
                    .map_err(|e| $crate::IdError::InvalidUuid {
                        label: Self::LABEL,
                        message: e.to_string(),
                    })?;

                if uuid.get_version_num() != 4 {
                    return Err($crate::IdError::WrongVersion {
                        label: Self::LABEL,
                        version: uuid.get_version_num(),
                    });
                }

                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<$crate::Uuid> for $name {
            fn as_ref(&self) -> &$crate::Uuid {
                &self.0
            }
        }
    };
}
