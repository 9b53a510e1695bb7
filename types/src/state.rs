//! Identity registration states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Where an identity stands in the on-chain registration process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// No registration has been attempted.
    #[default]
    Unregistered,
    /// A registration transaction was submitted and is not yet mined.
    InProgress,
    /// The identity is registered on chain.
    Registered,
    /// The registration transaction failed.
    RegistrationError,
}

impl RegistrationStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unregistered => "Unregistered",
            Self::InProgress => "InProgress",
            Self::Registered => "Registered",
            Self::RegistrationError => "RegistrationError",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrationStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unregistered" => Ok(Self::Unregistered),
            "InProgress" => Ok(Self::InProgress),
            "Registered" => Ok(Self::Registered),
            "RegistrationError" => Ok(Self::RegistrationError),
            other => Err(TypesError::UnknownRegistrationStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_status() {
        for status in [
            RegistrationStatus::Unregistered,
            RegistrationStatus::InProgress,
            RegistrationStatus::Registered,
            RegistrationStatus::RegistrationError,
        ] {
            assert_eq!(status.as_str().parse::<RegistrationStatus>().unwrap(), status);
        }
        assert!("Pending".parse::<RegistrationStatus>().is_err());
    }

    #[test]
    fn only_registered_is_registered() {
        assert!(RegistrationStatus::Registered.is_registered());
        assert!(!RegistrationStatus::InProgress.is_registered());
    }
}
