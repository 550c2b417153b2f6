//! Process wiring: the upstream registry, static OIDC upstreams and one
//! controller runner per directory kind.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tollbridge_auth::federation::{
    DirectoryKind, Ldap3Dialer, LdapDialer, UpstreamLoginService, UpstreamOidcClient,
    UpstreamOidcIdentityProvider, UpstreamRegistry,
};
use tollbridge_controller::{ControllerRunner, DirectoryUpstreamWatcher, InMemoryStore};

use crate::config::SupervisorConfig;

/// A fully wired supervisor, ready to [`run`](Supervisor::run).
pub struct Supervisor {
    registry: Arc<UpstreamRegistry>,
    store: Arc<InMemoryStore>,
    runners: Vec<Arc<ControllerRunner>>,
}

/// Builds a [`Supervisor`] from configuration.
#[must_use]
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    dialer: Option<Arc<dyn LdapDialer>>,
}

impl SupervisorBuilder {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            dialer: None,
        }
    }

    /// Overrides the directory dialer. Defaults to [`Ldap3Dialer`].
    pub fn with_dialer(mut self, dialer: Arc<dyn LdapDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Discovers the static OIDC upstreams, loads directory upstreams and
    /// secrets into the store and creates the controller runners.
    ///
    /// An OIDC upstream whose discovery fails is logged and left out.
    pub async fn build(self) -> anyhow::Result<Supervisor> {
        let config = self.config;
        let registry = Arc::new(UpstreamRegistry::new());

        let mut oidc: Vec<Arc<dyn UpstreamOidcIdentityProvider>> = Vec::new();
        for settings in &config.oidc_upstreams {
            match UpstreamOidcClient::discover(settings, &config.federation).await {
                Ok(client) => oidc.push(Arc::new(client)),
                Err(err) => tracing::error!(
                    upstream = %settings.name,
                    issuer = %settings.issuer,
                    error = %err,
                    "OIDC upstream discovery failed, upstream disabled"
                ),
            }
        }
        tracing::info!(
            configured = config.oidc_upstreams.len(),
            available = oidc.len(),
            "Loaded static OIDC upstreams"
        );
        registry.set_oidc_providers(oidc);

        let store = Arc::new(InMemoryStore::new());
        for secret in &config.secrets {
            store.apply_secret(secret.to_secret());
        }
        for upstream in &config.ldap_upstreams {
            store.apply_provider(DirectoryKind::Ldap, upstream.to_resource());
        }
        for upstream in &config.active_directory_upstreams {
            store.apply_provider(DirectoryKind::ActiveDirectory, upstream.to_resource());
        }

        let dialer = self
            .dialer
            .unwrap_or_else(|| {
                Arc::new(Ldap3Dialer::new(config.federation.ldap_timeout)) as Arc<dyn LdapDialer>
            });

        let runners = [DirectoryKind::Ldap, DirectoryKind::ActiveDirectory]
            .into_iter()
            .map(|kind| {
                let watcher = DirectoryUpstreamWatcher::new(
                    kind,
                    registry.clone(),
                    store.clone(),
                    store.clone(),
                    dialer.clone(),
                )
                .with_probe_timeout(config.controller.probe_timeout);
                Arc::new(
                    ControllerRunner::new(Arc::new(watcher), config.controller.clone())
                        .with_changes(store.subscribe()),
                )
            })
            .collect();

        Ok(Supervisor {
            registry,
            store,
            runners,
        })
    }
}

impl Supervisor {
    #[must_use]
    pub fn registry(&self) -> Arc<UpstreamRegistry> {
        self.registry.clone()
    }

    /// The store holding directory resources and secrets.
    #[must_use]
    pub fn store(&self) -> Arc<InMemoryStore> {
        self.store.clone()
    }

    /// A login service reading this supervisor's registry.
    #[must_use]
    pub fn login_service(&self) -> UpstreamLoginService {
        UpstreamLoginService::new(self.registry.clone())
    }

    #[must_use]
    pub fn runners(&self) -> &[Arc<ControllerRunner>] {
        &self.runners
    }

    /// Runs the controllers until `shutdown` resolves, then stops them and
    /// waits for them to finish.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();
        for runner in &self.runners {
            let runner = runner.clone();
            tasks.spawn(async move { runner.run().await });
        }
        tracing::info!(controllers = self.runners.len(), "Supervisor started");

        shutdown.await;
        tracing::info!("Shutdown requested, stopping controllers");

        for runner in &self.runners {
            runner.shutdown();
        }
        while let Some(result) = tasks.join_next().await {
            result?;
        }

        tracing::info!("Supervisor stopped");
        Ok(())
    }
}
