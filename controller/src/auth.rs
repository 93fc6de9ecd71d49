use std::sync::Arc;

use fireplace_common::{
    ecobee::{
        AuthorizeResponse, TokenResponse, AUTHORIZE_PATH, PIN_GRANT_TYPE, PIN_RESPONSE_TYPE,
        REFRESH_GRANT_TYPE, SCOPE, TOKEN_PATH,
    },
    PairingState,
};
use tracing::{info, warn};

use crate::{
    error::{FireplaceError, Result},
    remote::{RemoteApi, RemoteRequest, RemoteResponse},
    token_store::TokenStore,
};

/// PIN pairing and token lifecycle against the vendor API.
///
/// The access token lives only in memory; the authorization code and refresh token are
/// written through the [`TokenStore`].
pub struct AuthSession {
    client_id: String,
    store: TokenStore,
    transport: Arc<dyn RemoteApi>,
    access_token: Option<String>,
}

impl AuthSession {
    pub fn new(client_id: String, store: TokenStore, transport: Arc<dyn RemoteApi>) -> Self {
        Self {
            client_id,
            store,
            transport,
            access_token: None,
        }
    }

    /// Builds a session and mints an access token from whatever credential is on disk.
    pub async fn connect(
        client_id: String,
        store: TokenStore,
        transport: Arc<dyn RemoteApi>,
    ) -> Self {
        let mut session = Self::new(client_id, store, transport);

        match session.pairing_state() {
            PairingState::Unpaired => {
                info!("no ecobee authorization code found; request one at /api/authorize");
            }
            PairingState::PendingToken => {
                if let Err(err) = session.exchange_auth_code().await {
                    warn!("unable to request access token, try reauthorizing: {err}");
                }
            }
            PairingState::Paired => {
                if let Err(err) = session.refresh().await {
                    warn!("startup token refresh failed: {err}");
                }
            }
        }

        session
    }

    pub fn pairing_state(&self) -> PairingState {
        self.store.credential().pairing_state()
    }

    pub fn access_token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .ok_or(FireplaceError::Unauthorized)
    }

    /// Returns the access token, first minting one from the stored credential if none is
    /// held. A startup exchange that failed is retried here by the next caller.
    pub async fn ensure_access_token(&mut self) -> Result<&str> {
        if self.access_token.is_none() {
            match self.pairing_state() {
                PairingState::Unpaired => return Err(FireplaceError::Unauthorized),
                PairingState::PendingToken => self.exchange_auth_code().await?,
                PairingState::Paired => self.refresh().await?,
            }
        }
        self.access_token()
    }

    /// Requests a new device PIN. The returned PIN is entered by the user in the vendor portal.
    pub async fn begin_pairing(&mut self) -> Result<String> {
        let request = RemoteRequest::get(AUTHORIZE_PATH)
            .query("response_type", PIN_RESPONSE_TYPE)
            .query("client_id", self.client_id.as_str())
            .query("scope", SCOPE);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(FireplaceError::Auth(format!(
                "authorize returned {}: {}",
                response.status, response.body
            )));
        }

        let authorization: AuthorizeResponse = response.json()?;
        self.store
            .set_auth_code(Some(authorization.code.as_str()))
            .await?;
        info!(
            "pairing started; PIN expires in {} minutes",
            authorization.expires_in.unwrap_or_default()
        );
        Ok(authorization.pin)
    }

    /// Exchanges the stored authorization code once. Returns whether a token was minted.
    pub async fn complete_pairing(&mut self) -> Result<bool> {
        match self.exchange_auth_code().await {
            Ok(()) => Ok(self.access_token.is_some()),
            Err(err @ FireplaceError::Storage(_)) => Err(err),
            Err(err) => {
                warn!("unable to request access token, try reauthorizing: {err}");
                Ok(false)
            }
        }
    }

    /// Trades the refresh token for a new token pair.
    pub async fn refresh(&mut self) -> Result<()> {
        let refresh_token = self
            .store
            .credential()
            .refresh_token
            .clone()
            .ok_or(FireplaceError::Unauthorized)?;

        let request = RemoteRequest::post(TOKEN_PATH)
            .query("grant_type", REFRESH_GRANT_TYPE)
            .query("refresh_token", refresh_token)
            .query("client_id", self.client_id.as_str());
        self.mint(request).await?;
        info!("access token refreshed");
        Ok(())
    }

    pub async fn send(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        self.transport.send(request).await
    }

    async fn exchange_auth_code(&mut self) -> Result<()> {
        let code = self
            .store
            .credential()
            .auth_code
            .clone()
            .ok_or(FireplaceError::Unauthorized)?;

        let request = RemoteRequest::post(TOKEN_PATH)
            .query("grant_type", PIN_GRANT_TYPE)
            .query("code", code)
            .query("client_id", self.client_id.as_str());
        self.mint(request).await?;
        info!("ecobee pairing complete");
        Ok(())
    }

    async fn mint(&mut self, request: RemoteRequest) -> Result<()> {
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(FireplaceError::Auth(format!(
                "token exchange returned {}: {}",
                response.status, response.body
            )));
        }

        let tokens: TokenResponse = response.json()?;
        self.store
            .set_refresh_token(tokens.refresh_token.as_deref())
            .await?;
        self.access_token = Some(tokens.access_token);
        Ok(())
    }
}
