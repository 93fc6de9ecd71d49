use serde::{Deserialize, Serialize};

/// Long-lived device authorization pair. Persisted as one JSON record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "authCode", default)]
    pub auth_code: Option<String>,
    #[serde(rename = "refreshToken", default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairingState {
    Unpaired,
    PendingToken,
    Paired,
}

impl PairingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaired => "UNPAIRED",
            Self::PendingToken => "PENDING_TOKEN",
            Self::Paired => "PAIRED",
        }
    }
}

impl Credential {
    /// Returns true when the stored code changed. Empty input is ignored.
    pub fn set_auth_code(&mut self, code: Option<&str>) -> bool {
        assign_non_empty(&mut self.auth_code, code)
    }

    /// Returns true when the stored token changed. Empty input is ignored.
    pub fn set_refresh_token(&mut self, token: Option<&str>) -> bool {
        assign_non_empty(&mut self.refresh_token, token)
    }

    pub fn pairing_state(&self) -> PairingState {
        if self.refresh_token.is_some() {
            PairingState::Paired
        } else if self.auth_code.is_some() {
            PairingState::PendingToken
        } else {
            PairingState::Unpaired
        }
    }

    /// Drops empty strings that may have been written by hand into the record.
    pub fn normalize(&mut self) {
        if self.auth_code.as_deref().is_some_and(str::is_empty) {
            self.auth_code = None;
        }
        if self.refresh_token.as_deref().is_some_and(str::is_empty) {
            self.refresh_token = None;
        }
    }
}

fn assign_non_empty(slot: &mut Option<String>, value: Option<&str>) -> bool {
    let Some(value) = value.filter(|value| !value.is_empty()) else {
        return false;
    };
    if slot.as_deref() == Some(value) {
        return false;
    }
    *slot = Some(value.to_string());
    true
}
