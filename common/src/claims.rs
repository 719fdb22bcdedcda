use std::collections::HashSet;
use std::ops::Add;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::Secret;

/// Clock skew tolerated when checking `exp` and `nbf`.
pub const LEEWAY_SECONDS: u64 = 30;

/// How long a fetched user permission set may be served from cache.
pub const PERMISSION_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// Role that short-circuits every permission check.
pub const ADMIN_ROLE: &str = "admin";

/// Token lifetime for freshly minted machine tokens.
///
/// We don't use the convention of 5 minutes because a deployment pipeline run can easily
/// take longer. When that happens, calls between services would start failing mid-build.
pub const MACHINE_TOKEN_TTL_MINUTES: i64 = 15;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Machine,
}

/// The JWT body shared by both token families.
///
/// User tokens are issued by the external identity provider and carry none of the
/// grant claims; machine tokens are minted by the identity service and embed the
/// grants that were current at issuance time.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Claim {
    /// Subject (user id or machine client id).
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Expiration time (as UTC timestamp).
    pub exp: usize,
    /// Issued at (as UTC timestamp).
    #[serde(default)]
    pub iat: usize,
    /// Not Before (as UTC timestamp). The identity provider omits it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<usize>,
    /// Role names granted to a machine client at issuance time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Flattened permission set for a machine client at issuance time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
}

impl Claim {
    /// Create the claim for a new machine token.
    pub fn new_machine(
        sub: Uuid,
        roles: Vec<String>,
        permissions: Vec<String>,
        iss: impl Into<String>,
        aud: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let iat = Utc::now();
        let exp = iat.add(ttl);

        Self {
            sub: sub.to_string(),
            iss: iss.into(),
            aud: aud.into(),
            exp: exp.timestamp() as usize,
            iat: iat.timestamp() as usize,
            nbf: Some(iat.timestamp() as usize),
            roles,
            permissions,
        }
    }

    pub fn into_token(self, secret: &Secret) -> Result<String, jsonwebtoken::errors::Error> {
        encode(
            &Header::new(Algorithm::HS256),
            &self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }
}

/// The authenticated subject of a request. Derived from a verified token, never persisted.
#[derive(Clone, Debug)]
pub struct Principal {
    pub id: Uuid,
    pub kind: PrincipalKind,
    pub roles: HashSet<String>,
    pub permissions: HashSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("missing permission: {permission}")]
pub struct PermissionDenied {
    pub permission: String,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_ROLE)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_admin() || self.permissions.contains(permission)
    }

    /// The permission check contract used by every handler.
    pub fn require(&self, permission: &str) -> Result<(), PermissionDenied> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(PermissionDenied {
                permission: permission.to_string(),
            })
        }
    }
}

/// Verification failures, reduced to the categories we are willing to expose.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AuthError {
    #[error("expired")]
    Expired,
    #[error("bad_signature")]
    BadSignature,
    #[error("wrong_audience")]
    WrongAudience,
    #[error("invalid_token")]
    InvalidToken,
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind::*;

        match err.kind() {
            ExpiredSignature => AuthError::Expired,
            InvalidSignature => AuthError::BadSignature,
            InvalidAudience => AuthError::WrongAudience,
            _ => AuthError::InvalidToken,
        }
    }
}

/// Expected `iss`/`aud` values and the verification secret for one token family.
#[derive(Clone)]
pub struct TokenFamily {
    pub secret: Secret,
    /// Expected issuer. The identity provider's issuer varies per project, so the
    /// user family may leave it unset and match on audience alone.
    pub issuer: Option<String>,
    pub audience: String,
}

/// A claim that passed signature and time checks, tagged with its family.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedToken {
    pub kind: PrincipalKind,
    pub claim: Claim,
}

impl VerifiedToken {
    fn principal(self, roles: HashSet<String>, permissions: HashSet<String>) -> Result<Principal, AuthError> {
        let id = Uuid::parse_str(&self.claim.sub).map_err(|_| AuthError::InvalidToken)?;

        Ok(Principal {
            id,
            kind: self.kind,
            roles,
            permissions,
            issued_at: Utc
                .timestamp_opt(self.claim.iat as i64, 0)
                .single()
                .ok_or(AuthError::InvalidToken)?,
            expires_at: Utc
                .timestamp_opt(self.claim.exp as i64, 0)
                .single()
                .ok_or(AuthError::InvalidToken)?,
        })
    }

    /// Build a machine principal from the grants embedded in the token body.
    pub fn into_machine_principal(self) -> Result<Principal, AuthError> {
        let roles = self.claim.roles.iter().cloned().collect();
        let permissions = self.claim.permissions.iter().cloned().collect();

        self.principal(roles, permissions)
    }

    /// Build a user principal from grants fetched out of the identity store.
    pub fn into_user_principal(
        self,
        roles: HashSet<String>,
        permissions: HashSet<String>,
    ) -> Result<Principal, AuthError> {
        self.principal(roles, permissions)
    }
}

/// Unified verifier for both bearer token families.
#[derive(Clone)]
pub struct TokenVerifier {
    user: TokenFamily,
    machine: TokenFamily,
}

impl TokenVerifier {
    pub fn new(user: TokenFamily, machine: TokenFamily) -> Self {
        Self { user, machine }
    }

    /// Parse, classify and verify a bearer token.
    ///
    /// Classification looks at the (unverified) `iss` and `aud` to pick the family,
    /// then the token is fully verified against that family's secret. Tokens that
    /// match neither family are rejected as `invalid_token`.
    pub fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let unverified = Self::peek(token)?;

        if unverified.iss == self.machine.issuer.as_deref().unwrap_or_default()
            && unverified.aud == self.machine.audience
        {
            let claim = self.verify_family(token, &self.machine)?;
            Ok(VerifiedToken {
                kind: PrincipalKind::Machine,
                claim,
            })
        } else if unverified.aud == self.user.audience {
            let claim = self.verify_family(token, &self.user)?;
            Ok(VerifiedToken {
                kind: PrincipalKind::User,
                claim,
            })
        } else {
            Err(AuthError::InvalidToken)
        }
    }

    /// Decode the payload without verifying the signature, for classification only.
    fn peek(token: &str) -> Result<Claim, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        Ok(decode::<Claim>(token, &DecodingKey::from_secret(&[]), &validation)?.claims)
    }

    fn verify_family(&self, token: &str, family: &TokenFamily) -> Result<Claim, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECONDS;
        validation.set_audience(&[&family.audience]);
        if let Some(iss) = &family.issuer {
            validation.set_issuer(&[iss]);
        }

        let claim = decode::<Claim>(
            token,
            &DecodingKey::from_secret(family.secret.as_bytes()),
            &validation,
        )?
        .claims;

        // The provider omits `nbf`, so jsonwebtoken cannot be asked to require it.
        if let Some(nbf) = claim.nbf {
            if (Utc::now().timestamp() + LEEWAY_SECONDS as i64) < nbf as i64 {
                return Err(AuthError::InvalidToken);
            }
        }

        Ok(claim)
    }
}
