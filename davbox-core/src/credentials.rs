use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use url::Url;

/// Credentials attached to every request a client sends. Anonymous
/// credentials never produce an Authorization header.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { user: String, password: String },
    Bearer { token: String },
}

impl Credentials {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials::Bearer {
            token: token.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }

    /// Only bearer tokens can be re-minted without user interaction.
    pub fn can_be_refreshed(&self) -> bool {
        matches!(self, Credentials::Bearer { .. })
    }

    pub fn auth_token(&self) -> &str {
        match self {
            Credentials::Anonymous => "",
            Credentials::Basic { password, .. } => password,
            Credentials::Bearer { token } => token,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self {
            Credentials::Basic { user, .. } => Some(user),
            _ => None,
        }
    }

    pub fn header_value(&self) -> Option<String> {
        match self {
            Credentials::Anonymous => None,
            Credentials::Basic { user, password } => {
                Some(format!("Basic {}", BASE64.encode(format!("{user}:{password}"))))
            }
            Credentials::Bearer { token } => Some(format!("Bearer {token}")),
        }
    }

    /// Cache key for clients whose account name is not yet known.
    pub fn session_name(&self, base_url: &Url) -> String {
        format!("{}#{}", base_url, self.auth_token())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => write!(f, "Credentials::Anonymous"),
            Credentials::Basic { user, .. } => write!(f, "Credentials::Basic({user})"),
            Credentials::Bearer { .. } => write!(f, "Credentials::Bearer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_has_no_header() {
        assert_eq!(Credentials::Anonymous.header_value(), None);
        assert!(Credentials::Anonymous.is_anonymous());
    }

    #[test]
    fn basic_header_is_encoded() {
        let creds = Credentials::basic("alice", "secret");
        assert_eq!(
            creds.header_value().unwrap(),
            "Basic YWxpY2U6c2VjcmV0"
        );
    }

    #[test]
    fn bearer_header_carries_token() {
        let creds = Credentials::bearer("tok-1");
        assert_eq!(creds.header_value().unwrap(), "Bearer tok-1");
        assert!(creds.can_be_refreshed());
    }

    #[test]
    fn session_name_combines_url_and_token() {
        let url = Url::parse("https://cloud.example.org/").unwrap();
        let creds = Credentials::bearer("tok-1");
        assert_eq!(creds.session_name(&url), "https://cloud.example.org/#tok-1");
    }
}
