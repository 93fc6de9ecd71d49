use std::time::Duration;

use fireplace_common::{
    ecobee::{
        is_expired_token, ApiStatus, Event, FunctionRequest, Runtime, Selection, Thermostat,
        ThermostatFunction, ThermostatQuery, ThermostatResponse, THERMOSTAT_PATH,
    },
    PairingState, QueryKind, SensorReading, TtlCache,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info};

use crate::{
    auth::AuthSession,
    error::{FireplaceError, Result},
    remote::{RemoteRequest, RemoteResponse},
};

/// Quota-aware front for the thermostat API.
///
/// All traffic goes through one async mutex: the cache check, the remote call, the
/// token refresh and the cache fill happen as one step, so two callers can never both
/// miss the cache for the same query.
pub struct EcobeeClient {
    inner: Mutex<ClientInner>,
}

struct ClientInner {
    session: AuthSession,
    cache: TtlCache<QueryKind, RemoteResponse>,
}

impl ClientInner {
    /// Sends the request built by `call`, refreshing the token and retrying once if the
    /// API reports it expired.
    async fn call_with_refresh<F>(&mut self, call: &F) -> Result<RemoteResponse>
    where
        F: Fn(&str) -> RemoteRequest + Send + Sync,
    {
        let request = call(self.session.ensure_access_token().await?);
        let response = self.session.send(request).await?;
        if !is_expired_token(response.status, &response.body) {
            return response.error_for_status();
        }

        info!("access token expired, refreshing");
        self.session.refresh().await?;

        let request = call(self.session.access_token()?);
        self.session.send(request).await?.error_for_status()
    }

    /// Cached read. A current entry for `key` is returned without touching the network.
    async fn cached<F>(&mut self, key: QueryKind, call: F) -> Result<RemoteResponse>
    where
        F: Fn(&str) -> RemoteRequest + Send + Sync,
    {
        if let Some(hit) = self.cache.get(&key, now()) {
            debug!(query = key.as_str(), "cache hit");
            return Ok(hit.clone());
        }

        let response = self.call_with_refresh(&call).await?;
        self.cache.insert(key, response.clone(), now());
        Ok(response)
    }

    async fn thermostat(&mut self, key: QueryKind) -> Result<Thermostat> {
        let body = ThermostatQuery {
            selection: Selection::for_query(key),
        }
        .to_query_param()?;
        let response = self
            .cached(key, |token| thermostat_get(token, &body))
            .await?;
        primary(response)
    }

    async fn runtime(&mut self) -> Result<Runtime> {
        let thermostat = self.thermostat(QueryKind::Runtime).await?;
        thermostat.runtime.ok_or_else(|| missing("runtime"))
    }

    /// Commands are never cached.
    async fn call_function(&mut self, function: ThermostatFunction) -> Result<()> {
        let name = function.name();
        let body = serde_json::to_value(FunctionRequest::single(function))?;
        let response = self
            .call_with_refresh(&|token: &str| {
                RemoteRequest::post(THERMOSTAT_PATH)
                    .query("format", "json")
                    .bearer(token)
                    .json(body.clone())
            })
            .await?;

        // A 200 can still carry a failure in the status block.
        let status: ApiStatus = response
            .json::<serde_json::Value>()?
            .get("status")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        if status.code != 0 {
            return Err(FireplaceError::Remote {
                status: response.status,
                body: response.body,
            });
        }
        info!("{name} accepted");
        Ok(())
    }
}

impl EcobeeClient {
    pub fn new(session: AuthSession, cache_life: Duration) -> Self {
        Self {
            inner: Mutex::new(ClientInner {
                session,
                cache: TtlCache::new(cache_life),
            }),
        }
    }

    pub async fn runtime(&self) -> Result<Runtime> {
        self.inner.lock().await.runtime().await
    }

    pub async fn sensors(&self) -> Result<Vec<SensorReading>> {
        let thermostat = self.inner.lock().await.thermostat(QueryKind::Sensors).await?;
        Ok(thermostat
            .remote_sensors
            .iter()
            .map(|sensor| sensor.reading())
            .collect())
    }

    pub async fn events(&self) -> Result<Vec<Event>> {
        let body = ThermostatQuery {
            selection: Selection::events(),
        }
        .to_query_param()?;
        let response = self
            .inner
            .lock()
            .await
            .call_with_refresh(&|token: &str| thermostat_get(token, &body))
            .await?;
        Ok(primary(response)?.events)
    }

    /// Engages an indefinite fan-on hold at the thermostat's setpoints. Without a known
    /// runtime the setpoints are read first, under the same lock as the hold itself.
    pub async fn hold_fan(&self, runtime: Option<Runtime>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let runtime = match runtime {
            Some(runtime) => runtime,
            None => inner.runtime().await?,
        };
        inner
            .call_function(ThermostatFunction::fan_hold(
                runtime.desired_heat,
                runtime.desired_cool,
            ))
            .await
    }

    pub async fn resume_program(&self) -> Result<()> {
        self.inner
            .lock()
            .await
            .call_function(ThermostatFunction::resume_program())
            .await
    }

    pub async fn begin_pairing(&self) -> Result<String> {
        self.inner.lock().await.session.begin_pairing().await
    }

    pub async fn complete_pairing(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let authorized = inner.session.complete_pairing().await?;
        if authorized {
            inner.cache.clear();
        }
        Ok(authorized)
    }

    pub async fn pairing_state(&self) -> PairingState {
        self.inner.lock().await.session.pairing_state()
    }
}

fn thermostat_get(token: &str, body: &str) -> RemoteRequest {
    RemoteRequest::get(THERMOSTAT_PATH)
        .query("format", "json")
        .query("body", body)
        .bearer(token)
}

fn primary(response: RemoteResponse) -> Result<Thermostat> {
    response
        .json::<ThermostatResponse>()?
        .into_primary()
        .ok_or_else(|| missing("thermostatList"))
}

fn missing(field: &str) -> FireplaceError {
    FireplaceError::Remote {
        status: 200,
        body: format!("response has no {field}"),
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
