use std::fmt::{Debug, Display, Formatter};

use zeroize::Zeroize;

/// A string-valued secret: a JWT signing key, an admin password, or a machine
/// client secret.
///
/// Neither [`Debug`] nor [`Display`] ever print the value, so secrets can sit
/// in config structs that derive `Debug` without leaking into logs. Code that
/// genuinely needs the value goes through [`expose`](Secret::expose) (or
/// [`as_bytes`](Secret::as_bytes) for signing keys), which keeps every use
/// greppable. The backing memory is zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The raw key material, as `jsonwebtoken`'s key constructors want it.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl Display for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("****")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
