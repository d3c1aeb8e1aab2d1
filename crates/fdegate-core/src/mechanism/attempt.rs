use fdegate_provider::{AuthorizationHost, AuthorizationResult, ContextKey};
use std::collections::HashMap;
use std::convert::Infallible;
use zeroize::Zeroizing;

/// In-process login attempt: context values, hints and the final result.
///
/// Used by operator drills and tests in place of the login window host.
/// Dropping the attempt wipes the password.
#[derive(Debug, Default)]
pub struct LoginAttempt {
    username: Option<String>,
    password: Option<Zeroizing<Vec<u8>>>,
    uid: Option<u32>,
    gid: Option<u32>,
    hints: HashMap<String, Vec<u8>>,
    result: Option<AuthorizationResult>,
}

impl LoginAttempt {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(Zeroizing::new(password.into().into_bytes())),
            ..Self::default()
        }
    }

    /// Attempt whose host exposes no credentials at all.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_ids(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn without_password(mut self) -> Self {
        self.password = None;
        self
    }

    pub fn result(&self) -> Option<AuthorizationResult> {
        self.result
    }

    /// Result set by the last stage, cleared for the next one.
    pub fn take_result(&mut self) -> Option<AuthorizationResult> {
        self.result.take()
    }

    pub fn hint_names(&self) -> impl Iterator<Item = &str> {
        self.hints.keys().map(String::as_str)
    }

    pub fn clear_password(&mut self) {
        self.password = None;
    }
}

impl AuthorizationHost for LoginAttempt {
    type Error = Infallible;

    fn context_value(&self, key: ContextKey) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(match key {
            ContextKey::Username => self.username.as_ref().map(|u| u.as_bytes().to_vec()),
            ContextKey::Password => self.password.as_ref().map(|p| p.to_vec()),
            ContextKey::Uid => self.uid.map(|uid| uid.to_string().into_bytes()),
            ContextKey::Gid => self.gid.map(|gid| gid.to_string().into_bytes()),
        })
    }

    fn set_hint(&mut self, name: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.hints.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn hint(&self, name: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.hints.get(name).cloned())
    }

    fn set_result(&mut self, result: AuthorizationResult) -> Result<(), Self::Error> {
        self.result = Some(result);
        Ok(())
    }
}
