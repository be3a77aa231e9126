use std::{fmt, path::PathBuf, str::FromStr};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

/// Seconds before the real expiry at which a token is treated as expired.
pub const EXPIRY_MARGIN_SECS: u64 = 240;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub expires_in: u64,
    pub obtained_at: u64,
}

impl Token {
    pub fn new(access_token: impl Into<String>, expires_in: u64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in,
            obtained_at: Utc::now().timestamp().max(0) as u64,
        }
    }

    pub fn is_expired(&self) -> bool {
        let now = Utc::now().timestamp().max(0) as u64;
        // short-lived tokens get half their lifetime as margin
        let margin = EXPIRY_MARGIN_SECS.min(self.expires_in / 2);
        now + margin >= self.obtained_at + self.expires_in
    }
}

/// Credential material taken from the connection string.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// API key and secret, exchanged with the `client_credentials` grant.
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
    /// `tenant\user` login, exchanged with the `password` grant.
    Password {
        tenant: String,
        username: String,
        password: String,
    },
}

impl Credentials {
    /// Picks the grant from the user part: `tenant\user` means a user login,
    /// anything else is an API key.
    pub fn from_user_password(user: &str, password: &str) -> Self {
        match user.split_once('\\') {
            Some((tenant, username)) => Credentials::Password {
                tenant: tenant.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            },
            None => Credentials::ClientCredentials {
                client_id: user.to_string(),
                client_secret: password.to_string(),
            },
        }
    }

    pub fn principal(&self) -> String {
        match self {
            Credentials::ClientCredentials { client_id, .. } => client_id.clone(),
            Credentials::Password {
                tenant, username, ..
            } => format!("{tenant}\\{username}"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("principal", &self.principal())
            .finish_non_exhaustive()
    }
}

/// Scan type of a downloadable FPR artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Static,
    Dynamic,
    Mobile,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Static => "Static",
            ArtifactKind::Dynamic => "Dynamic",
            ArtifactKind::Mobile => "Mobile",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(ArtifactKind::Static),
            "dynamic" => Ok(ArtifactKind::Dynamic),
            "mobile" => Ok(ArtifactKind::Mobile),
            other => Err(format!(
                "Unknown scan type '{other}'. Valid types are: static, dynamic, mobile"
            )),
        }
    }
}

/// One artifact download: which release, which scan type, and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub release_id: String,
    pub kind: ArtifactKind,
    pub destination: PathBuf,
}

impl DownloadTask {
    pub fn new(release_id: impl Into<String>, kind: ArtifactKind, destination: PathBuf) -> Self {
        Self {
            release_id: release_id.into(),
            kind,
            destination,
        }
    }

    pub fn target(&self) -> String {
        format!(
            "{kind} FPR of release {id} -> {dest}",
            kind = self.kind,
            id = self.release_id,
            dest = self.destination.display()
        )
    }
}

#[derive(Tabled)]
pub struct ReleaseTableRow {
    pub id: String,
    pub application: String,
    pub release: String,
    pub rating: String,
}

#[derive(Tabled)]
pub struct ScanTableRow {
    pub id: String,
    pub release: String,
    pub kind: String,
    pub completed: String,
}
