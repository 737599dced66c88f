//! Session memory used to restore a session after a transparent reconnect.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use kolibri_protocol::messages::{LoginParams, LoginResult};

use crate::error::ClientError;

/// Last successful login/subscribe/user-subscribe calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SessionMemory {
    pub login_params: Option<LoginParams>,
    pub login_result: Option<LoginResult>,
    pub subscribe_params: Option<Value>,
    pub subscribe_result: Option<Value>,
    pub user_subscribe_params: Option<Value>,
    pub user_subscribe_result: Option<Value>,
}

#[derive(Clone, Default)]
pub(crate) struct SessionState {
    memory: Arc<Mutex<SessionMemory>>,
}

impl SessionState {
    /// Creates session memory, seeding the login params from configured auth.
    pub(crate) fn new(auth: Option<LoginParams>) -> Self {
        Self {
            memory: Arc::new(Mutex::new(SessionMemory {
                login_params: auth,
                ..SessionMemory::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionMemory> {
        self.memory.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn store_login(&self, params: LoginParams, result: LoginResult) {
        let mut memory = self.lock();
        memory.login_params = Some(params);
        memory.login_result = Some(result);
    }

    /// Params for re-issuing the login after a reconnect.
    ///
    /// The client id from the last login result is attached so the broker
    /// resumes the same session.
    pub(crate) fn login_to_restore(&self) -> Result<LoginParams, ClientError> {
        let memory = self.lock();
        let mut params = memory
            .login_params
            .clone()
            .ok_or(ClientError::UnknownClientState)?;
        if let Some(client) = memory.login_result.as_ref().and_then(|r| r.client.clone()) {
            params.client = Some(client);
        }
        Ok(params)
    }

    pub(crate) fn store_subscribe(&self, params: Value, result: Value) {
        let mut memory = self.lock();
        memory.subscribe_params = Some(params);
        memory.subscribe_result = Some(result);
    }

    pub(crate) fn clear_subscribe(&self) {
        let mut memory = self.lock();
        memory.subscribe_params = None;
        memory.subscribe_result = None;
    }

    /// Remembered subscribe params, if both halves of the pair are present.
    pub(crate) fn subscribe_to_restore(&self) -> Option<Value> {
        let memory = self.lock();
        memory.subscribe_result.as_ref()?;
        memory.subscribe_params.clone()
    }

    pub(crate) fn store_user_subscribe(&self, params: Value, result: Value) {
        let mut memory = self.lock();
        memory.user_subscribe_params = Some(params);
        memory.user_subscribe_result = Some(result);
    }

    pub(crate) fn clear_user_subscribe(&self) {
        let mut memory = self.lock();
        memory.user_subscribe_params = None;
        memory.user_subscribe_result = None;
    }

    pub(crate) fn user_subscribe_to_restore(&self) -> Option<Value> {
        let memory = self.lock();
        memory.user_subscribe_result.as_ref()?;
        memory.user_subscribe_params.clone()
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> SessionMemory {
        self.lock().clone()
    }
}
