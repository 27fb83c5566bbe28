use std::{fmt::Display, str::FromStr};

use anyhow::{Error, anyhow};
use argon2::{
    password_hash::{self, rand_core::OsRng, PasswordHash, PasswordHashString, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use confidante_core::xmpp::jid::Jid;

use super::{MechanismNegotiatorResult, StoredPassword, StoredPasswordLookup};

#[derive(Debug)]
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(plaintext.as_bytes(), &salt)?.into();
        Ok(Self { hash })
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = password_hash::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s)?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// SASL PLAIN (RFC 4616), only ever advertised once the stream is
/// secured by TLS. A single response payload of the form
/// `authzid NUL authcid NUL password` carries the whole exchange; there
/// is no challenge round-trip.
pub(super) struct PlainNegotiator<S> {
    resolved_domain: String,
    store: S,
    authentication_id: Option<String>,
}

impl<S> PlainNegotiator<S>
where
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(resolved_domain: String, store: S) -> Self {
        PlainNegotiator {
            resolved_domain,
            store,
            authentication_id: None,
        }
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        match self.try_authenticate(payload).await {
            Ok(jid) => MechanismNegotiatorResult::Success(jid, None),
            Err(err) => MechanismNegotiatorResult::Failure(err),
        }
    }

    async fn try_authenticate(&mut self, payload: Vec<u8>) -> Result<Jid, Error> {
        let mut parts = payload.split(|&byte| byte == 0);
        let _authzid = parts.next().ok_or_else(|| anyhow!("malformed PLAIN response"))?;
        let authcid = parts
            .next()
            .ok_or_else(|| anyhow!("malformed PLAIN response"))?;
        let password = parts
            .next()
            .ok_or_else(|| anyhow!("malformed PLAIN response"))?;
        if parts.next().is_some() {
            return Err(anyhow!("malformed PLAIN response"));
        }

        let authcid = String::from_utf8(authcid.to_vec())?;
        let password = String::from_utf8(password.to_vec())?;

        let jid = Jid::new(Some(authcid.clone()), self.resolved_domain.clone(), None);
        let stored = self.store.get_stored_password_argon2(jid.clone()).await?;
        let stored: StoredPasswordArgon2 = stored.parse().map_err(|err: password_hash::Error| anyhow!(err))?;
        let hash = PasswordHash::new(stored.hash.as_str()).map_err(|err| anyhow!(err))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &hash)
            .map_err(|_| anyhow!("invalid password"))?;

        self.authentication_id = Some(authcid);
        Ok(jid)
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authentication_id
            .ok_or_else(|| anyhow!("PLAIN negotiator never completed authentication"))
    }
}
