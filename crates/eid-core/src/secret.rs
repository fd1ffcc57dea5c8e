//! Secrets entered by the user (PIN, CAN, PUK)

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Kind of secret, determines the expected number of digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    /// 5-digit PIN from the PIN letter
    TransportPin,
    /// 6-digit PIN chosen by the user
    PersonalPin,
    /// 6-digit Card Access Number printed on the card
    Can,
    /// 10-digit Personal Unblocking Key
    Puk,
}

impl SecretKind {
    /// Number of digits a secret of this kind must have
    pub fn digits(&self) -> usize {
        match self {
            SecretKind::TransportPin => 5,
            SecretKind::PersonalPin | SecretKind::Can => 6,
            SecretKind::Puk => 10,
        }
    }

    /// Check that `secret` is well-formed for this kind
    pub fn validate(&self, secret: &Secret) -> Result<(), SecretError> {
        let value = secret.expose();
        if !value.chars().all(|c| c.is_ascii_digit()) {
            return Err(SecretError::NonDigit(*self));
        }
        if value.len() != self.digits() {
            return Err(SecretError::Length {
                kind: *self,
                expected: self.digits(),
                actual: value.len(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecretKind::TransportPin => "transport PIN",
            SecretKind::PersonalPin => "personal PIN",
            SecretKind::Can => "CAN",
            SecretKind::Puk => "PUK",
        };
        f.write_str(s)
    }
}

/// Malformed secret
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    #[error("{kind} must have {expected} digits, got {actual}")]
    Length {
        kind: SecretKind,
        expected: usize,
        actual: usize,
    },

    #[error("{0} must only contain digits")]
    NonDigit(SecretKind),
}

/// A digit string entered by the user
///
/// The value is wiped from memory on drop and never printed by `Debug`.
/// Equality is exact string equality, without any normalization.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw digits (only for handing them to the card)
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<{} digits>)", self.0.len())
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
