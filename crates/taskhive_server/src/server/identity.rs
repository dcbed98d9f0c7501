#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use taskhive_domain::{OrganizationId, Principal, PrincipalId};
use thiserror::Error;

/// A string that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
	#[error("missing auth token")]
	MissingToken,

	#[error("invalid token format")]
	Malformed,

	#[error("invalid token signature")]
	BadSignature,

	#[error("token expired")]
	Expired,

	#[error("invalid token claims: {0}")]
	InvalidClaims(String),

	#[error("unknown token")]
	Unknown,

	#[error("no identity provider configured")]
	NotConfigured,
}

/// Resolves the acting principal from a connection's auth token.
pub trait IdentityProvider: Send + Sync {
	fn resolve(&self, token: &str) -> Result<Principal, IdentityError>;
}

/// Claims carried by a `v1.<claims>.<sig>` token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub org: Option<i64>,
	pub exp: u64,
}

impl TokenClaims {
	fn into_principal(self) -> Result<Principal, IdentityError> {
		let id = self
			.sub
			.parse::<PrincipalId>()
			.map_err(|e| IdentityError::InvalidClaims(format!("sub: {e}")))?;
		let organization = self
			.org
			.map(OrganizationId::new)
			.transpose()
			.map_err(|e| IdentityError::InvalidClaims(format!("org: {e}")))?;

		let name = if self.name.trim().is_empty() {
			format!("user{id}")
		} else {
			self.name
		};

		Ok(Principal::new(id, name).with_organization(organization))
	}
}

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Stateless HMAC-SHA256 tokens.
#[derive(Debug, Clone)]
pub struct HmacIdentityProvider {
	secret: SecretString,
}

impl HmacIdentityProvider {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}

	/// Sign a token for `principal` that expires `ttl_secs` from now.
	pub fn mint(&self, principal: &Principal, ttl_secs: u64) -> String {
		let claims = TokenClaims {
			sub: principal.id.to_string(),
			name: principal.username.clone(),
			org: principal.organization.map(OrganizationId::get),
			exp: unix_now().saturating_add(ttl_secs),
		};
		self.sign_claims(&claims)
	}

	fn sign_claims(&self, claims: &TokenClaims) -> String {
		let payload = serde_json::to_vec(claims).unwrap_or_default();
		let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
		let sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());
		format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig))
	}

	pub fn verify(&self, token: &str) -> Result<TokenClaims, IdentityError> {
		let parts = token.split('.').collect::<Vec<_>>();
		if parts.len() != 3 || parts[0] != "v1" {
			return Err(IdentityError::Malformed);
		}

		let payload_b64 = parts[1];
		let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| IdentityError::Malformed)?;
		let provided_sig = URL_SAFE_NO_PAD.decode(parts[2]).map_err(|_| IdentityError::Malformed)?;
		let expected_sig = sign(payload_b64.as_bytes(), self.secret.expose().as_bytes());

		if !constant_time_eq(&expected_sig, &provided_sig) {
			return Err(IdentityError::BadSignature);
		}

		let claims: TokenClaims =
			serde_json::from_slice(&payload).map_err(|e| IdentityError::InvalidClaims(e.to_string()))?;
		if claims.exp <= unix_now() {
			return Err(IdentityError::Expired);
		}

		Ok(claims)
	}
}

impl IdentityProvider for HmacIdentityProvider {
	fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(IdentityError::MissingToken);
		}
		self.verify(token)?.into_principal()
	}
}

/// Fixed token table, for development setups.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
	tokens: HashMap<String, Principal>,
}

impl StaticIdentityProvider {
	pub fn new(tokens: impl IntoIterator<Item = (String, Principal)>) -> Self {
		Self {
			tokens: tokens.into_iter().collect(),
		}
	}
}

impl IdentityProvider for StaticIdentityProvider {
	fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(IdentityError::MissingToken);
		}
		self.tokens.get(token).cloned().ok_or(IdentityError::Unknown)
	}
}

/// First provider that accepts the token wins; the last error is reported otherwise.
#[derive(Clone, Default)]
pub struct ChainedIdentityProvider {
	providers: Vec<Arc<dyn IdentityProvider>>,
}

impl ChainedIdentityProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
		self.providers.push(provider);
		self
	}

	pub fn is_empty(&self) -> bool {
		self.providers.is_empty()
	}
}

impl IdentityProvider for ChainedIdentityProvider {
	fn resolve(&self, token: &str) -> Result<Principal, IdentityError> {
		let mut last = IdentityError::NotConfigured;
		for provider in &self.providers {
			match provider.resolve(token) {
				Ok(principal) => return Ok(principal),
				Err(e) => last = e,
			}
		}
		Err(last)
	}
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// HMAC accepts keys of any length, so this never fails.
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
		return Vec::new();
	};
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn alice() -> Principal {
		Principal::new(PrincipalId::new(5).unwrap(), "alice").with_organization(Some(OrganizationId::new(3).unwrap()))
	}

	#[test]
	fn minted_token_resolves_to_principal() {
		let provider = HmacIdentityProvider::new(SecretString::new("s3cret"));
		let token = provider.mint(&alice(), 60);
		assert!(token.starts_with("v1."));
		assert_eq!(provider.resolve(&token).unwrap(), alice());
	}

	#[test]
	fn tampered_and_foreign_tokens_are_rejected() {
		let provider = HmacIdentityProvider::new(SecretString::new("s3cret"));
		let other = HmacIdentityProvider::new(SecretString::new("other"));
		let token = other.mint(&alice(), 60);
		assert_eq!(provider.resolve(&token).unwrap_err(), IdentityError::BadSignature);
		assert_eq!(provider.resolve("v2.a.b").unwrap_err(), IdentityError::Malformed);
		assert_eq!(provider.resolve("  ").unwrap_err(), IdentityError::MissingToken);
	}

	#[test]
	fn expired_token_is_rejected() {
		let provider = HmacIdentityProvider::new(SecretString::new("s3cret"));
		let claims = TokenClaims {
			sub: "5".to_string(),
			name: "alice".to_string(),
			org: None,
			exp: unix_now() - 1,
		};
		let token = provider.sign_claims(&claims);
		assert_eq!(provider.resolve(&token).unwrap_err(), IdentityError::Expired);
	}

	#[test]
	fn non_positive_subject_is_invalid() {
		let provider = HmacIdentityProvider::new(SecretString::new("s3cret"));
		let claims = TokenClaims {
			sub: "0".to_string(),
			name: "nobody".to_string(),
			org: None,
			exp: unix_now() + 60,
		};
		let token = provider.sign_claims(&claims);
		assert!(matches!(
			provider.resolve(&token).unwrap_err(),
			IdentityError::InvalidClaims(_)
		));
	}

	#[test]
	fn chain_falls_through_to_static_table() {
		let hmac = Arc::new(HmacIdentityProvider::new(SecretString::new("s3cret")));
		let table = Arc::new(StaticIdentityProvider::new([("dev-alice".to_string(), alice())]));
		let chain = ChainedIdentityProvider::new().with(hmac).with(table);

		assert_eq!(chain.resolve("dev-alice").unwrap(), alice());
		assert_eq!(chain.resolve("nope").unwrap_err(), IdentityError::Unknown);
		assert_eq!(
			ChainedIdentityProvider::new().resolve("dev-alice").unwrap_err(),
			IdentityError::NotConfigured
		);
	}
}
