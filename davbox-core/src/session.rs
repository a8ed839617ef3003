use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use url::Url;

use crate::client::{DavClient, TransportError};
use crate::credentials::Credentials;

/// Everything needed to reach one account on one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    /// Unset while the server-side username is still unknown, e.g.
    /// before the first successful login.
    pub name: Option<String>,
    pub base_url: Url,
    pub credentials: Credentials,
}

impl AccountSpec {
    pub fn user_id(&self) -> &str {
        self.name
            .as_deref()
            .or_else(|| self.credentials.user())
            .unwrap_or("")
    }

    fn session_name(&self) -> String {
        self.credentials.session_name(&self.base_url)
    }
}

/// Cache of one client per account. Clients created before the account
/// name is known are keyed by session and adopted under the account
/// name once it appears, so cookies and connections survive login.
pub struct SessionManager {
    user_agent: String,
    clients_by_account: Mutex<HashMap<String, Arc<DavClient>>>,
    clients_by_session: Mutex<HashMap<String, Arc<DavClient>>>,
}

impl SessionManager {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            clients_by_account: Mutex::new(HashMap::new()),
            clients_by_session: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn client_for(&self, account: &AccountSpec) -> Result<Arc<DavClient>, TransportError> {
        let session_name = account.session_name();

        let mut reused = match &account.name {
            Some(name) => self.clients_by_account.lock().unwrap().get(name).cloned(),
            None => None,
        };
        if reused.is_none() {
            match &account.name {
                Some(name) => {
                    // A client opened before login carries the session's
                    // cookies; move it under the account name.
                    if let Some(client) =
                        self.clients_by_session.lock().unwrap().remove(&session_name)
                    {
                        debug!(account = %name, "adopting session client");
                        self.clients_by_account
                            .lock()
                            .unwrap()
                            .insert(name.clone(), client.clone());
                        reused = Some(client);
                    }
                }
                None => {
                    reused = self
                        .clients_by_session
                        .lock()
                        .unwrap()
                        .get(&session_name)
                        .cloned();
                }
            }
        }

        if let Some(client) = reused {
            client.set_credentials(account.credentials.clone());
            if client.base_url() != account.base_url {
                client.set_base_url(account.base_url.clone());
            }
            if !account.user_id().is_empty() {
                client.set_user_id(account.user_id());
            }
            return Ok(client);
        }

        let client = Arc::new(DavClient::new(
            account.base_url.clone(),
            self.user_agent.clone(),
            true,
        )?);
        client.set_credentials(account.credentials.clone());
        if !account.user_id().is_empty() {
            client.set_user_id(account.user_id());
        }
        match &account.name {
            Some(name) => {
                debug!(account = %name, "new client");
                self.clients_by_account
                    .lock()
                    .unwrap()
                    .insert(name.clone(), client.clone());
            }
            None => {
                debug!(session = %session_name, "new session client");
                self.clients_by_session
                    .lock()
                    .unwrap()
                    .insert(session_name, client.clone());
            }
        }
        Ok(client)
    }

    /// Drops the cached client so a broken session is never reused.
    pub fn remove_client_for(&self, account: &AccountSpec) {
        if let Some(name) = &account.name
            && self
                .clients_by_account
                .lock()
                .unwrap()
                .remove(name)
                .is_some()
        {
            debug!(account = %name, "removed client");
            return;
        }
        self.clients_by_session
            .lock()
            .unwrap()
            .remove(&account.session_name());
    }
}
