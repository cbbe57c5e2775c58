//! Resource identifiers.
//!
//! Caches, build configurations and runs are identified by the integer keys the
//! job store assigns them. Each gets its own newtype so a run id can never be
//! passed where a configuration id is expected.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            Display, From,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(i64);

        impl $name {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Get the raw integer key.
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

integer_id!(
    /// Identifier of a binary cache.
    CacheId
);

integer_id!(
    /// Identifier of a build configuration (a "builder").
    ConfigId
);

integer_id!(
    /// Identifier of a single run of a build configuration.
    RunId
);
