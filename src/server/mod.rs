//! HTTP surface: component wiring, router and graceful shutdown.

mod response;
mod routes;

pub use response::status_for;
pub use routes::{AppState, Authenticated, create_router};

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::federation::StsFederation;
use crate::identity::{HttpKeySetSource, KeyCache, TokenVerifier, VerifierSettings};
use crate::issuer::{CredentialIssuer, IssuerSettings};
use crate::lifecycle::{LifecyclePolicy, RequestLifecycle};
use crate::store::dynamodb::DynamoClient;
use crate::store::{
    DynamoGrantStore, DynamoRequestStore, GrantStore, InMemoryGrantStore, InMemoryRequestStore,
    RequestStore,
};
use crate::trust_roles::TrustRoleResolver;
use crate::{Error, Result};

/// Access broker server
pub struct Broker {
    config: Config,
    state: Arc<AppState>,
}

impl Broker {
    /// Build every component from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or a client
    /// cannot be constructed (e.g. missing AWS base credentials).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let source = HttpKeySetSource::new(
            config.identity.resolved_jwks_uri(),
            config.identity.fetch_timeout,
        )?;
        let keys = Arc::new(KeyCache::new(Arc::new(source)));
        let verifier = Arc::new(TokenVerifier::new(
            keys,
            VerifierSettings::from(&config.identity),
        ));

        let (requests, grants): (Arc<dyn RequestStore>, Arc<dyn GrantStore>) =
            match config.store.backend {
                StoreBackend::Memory => {
                    warn!("Using in-memory store; requests and grants are lost on restart");
                    (
                        Arc::new(InMemoryRequestStore::new()),
                        Arc::new(InMemoryGrantStore::new()),
                    )
                }
                StoreBackend::Dynamodb => {
                    let client = Arc::new(DynamoClient::from_config(
                        &config.store,
                        &config.federation.region,
                    )?);
                    (
                        Arc::new(DynamoRequestStore::new(
                            Arc::clone(&client),
                            config.store.requests_table.clone(),
                        )),
                        Arc::new(DynamoGrantStore::new(
                            client,
                            config.store.grants_table.clone(),
                        )),
                    )
                }
            };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let lifecycle = RequestLifecycle::new(
            requests,
            Arc::clone(&grants),
            TrustRoleResolver::from_config(&config.access),
            Arc::clone(&clock),
            LifecyclePolicy::from_config(&config),
        );
        let federation = Arc::new(StsFederation::from_config(&config.federation)?);
        let issuer = Arc::new(CredentialIssuer::new(
            grants,
            federation,
            clock,
            IssuerSettings::from(&config),
        ));

        Ok(Self::from_state(
            config,
            Arc::new(AppState {
                verifier,
                lifecycle,
                issuer,
            }),
        ))
    }

    /// Wrap prebuilt components.
    #[must_use]
    pub fn from_state(config: Config, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// The router serving this broker.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        create_router(Arc::clone(&self.state), self.config.server.max_body_size)
    }

    /// Serve until Ctrl-C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        // Best effort; keys also load on first use.
        let keys = Arc::clone(self.state.verifier.keys());
        tokio::spawn(async move { keys.warm().await });

        let listener = TcpListener::bind(addr).await?;
        let app = self.router();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            host = %self.config.server.host,
            port = self.config.server.port,
            issuer = %self.config.identity.resolved_issuer(),
            store = ?self.config.store.backend,
            "Access broker listening"
        );

        let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                let _ = signalled_tx.send(());
            })
            .into_future();

        let drain = self.config.server.shutdown_timeout;
        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                if signalled_rx.await.is_ok() {
                    tokio::time::sleep(drain).await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {
                warn!(timeout_ms = drain.as_millis(), "Graceful shutdown timed out, dropping connections");
            }
        }

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
