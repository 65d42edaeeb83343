//! Wiring of servers, controllers and shutdown for both roles.
//!
//! Each service binds its server, registers its controller as listener and
//! accepts in the background until the controller's shutdown token fires.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ClientConfig};
use crate::error::{CommunicationError, ControllerError};
use crate::manager::{ManagerController, ModuleLauncher};
use crate::module::{ModuleController, ModuleRegistry};
use crate::transport::{CommunicationListener, Server};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Communication(#[from] CommunicationError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Manager role: accepts external peers and drives launched modules.
pub struct ManagerService {
    server: Server,
    controller: Arc<ManagerController>,
}

impl ManagerService {
    pub async fn bind(
        app: AppConfig,
        registry: ModuleRegistry,
        launcher: Arc<dyn ModuleLauncher>,
    ) -> Result<Self, ServiceError> {
        let server = Server::new(app.manager.server.clone());
        server.set_client_configuration(app.manager.client.clone()).await;
        let bind = app.manager.bind.clone();
        let controller = Arc::new(ManagerController::new(launcher, registry, app));

        server.bind(&bind).await?;
        server
            .add_listener(controller.clone() as Arc<dyn CommunicationListener>)
            .await;
        let address = server.local_addr().await;
        tracing::info!(address = ?address, "Manager listening");
        Ok(Self { server, controller })
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    pub fn controller(&self) -> &Arc<ManagerController> {
        &self.controller
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.controller.shutdown_token()
    }

    /// Serves until a peer requests `SHUTDOWN` or the token is cancelled.
    pub async fn run(self) {
        self.server.start_async().await;
        self.controller.shutdown_token().cancelled().await;

        self.controller.shutdown().await;
        self.server.set_client_configuration(ClientConfig::exit()).await;
        self.server.close().await;
        tracing::info!("Manager stopped");
    }
}

/// Module role: serves exactly one manager connection for one worker.
pub struct ModuleHost {
    server: Server,
    controller: Arc<ModuleController>,
}

impl ModuleHost {
    /// Instantiates `module` and binds the host. `pid` overrides the process
    /// identifier reported to the manager.
    pub async fn bind(
        app: &AppConfig,
        registry: &ModuleRegistry,
        module: &str,
        pid: Option<u32>,
    ) -> Result<Self, ServiceError> {
        let mut controller = ModuleController::from_registry(registry, module, app)?;
        if let Some(pid) = pid {
            controller = controller.with_process_id(pid);
        }
        let controller = Arc::new(controller);

        let server = Server::new(app.module.server.clone().with_num_clients(1));
        server.set_client_configuration(app.module.client.clone()).await;
        server.bind(&app.module.bind).await?;
        server
            .add_listener(controller.clone() as Arc<dyn CommunicationListener>)
            .await;
        let address = server.local_addr().await;
        tracing::info!(module, address = ?address, "Module host listening");
        Ok(Self { server, controller })
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.controller.shutdown_token()
    }

    /// Serves until the manager leaves, asks to exit, or the token is cancelled.
    pub async fn run(self) {
        self.server.start_async().await;
        self.controller.shutdown_token().cancelled().await;

        self.controller.shutdown();
        self.server.set_client_configuration(ClientConfig::exit()).await;
        self.server.close().await;
        tracing::info!(module = %self.controller.name(), "Module host stopped");
    }
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

/// Runs the manager role until shutdown, also stopping on Ctrl-C.
pub async fn run_manager(
    app: AppConfig,
    registry: ModuleRegistry,
    launcher: Arc<dyn ModuleLauncher>,
) -> Result<(), ServiceError> {
    let service = ManagerService::bind(app, registry, launcher).await?;
    cancel_on_interrupt(service.shutdown_token());
    service.run().await;
    Ok(())
}

/// Runs a module host for `module` until shutdown, also stopping on Ctrl-C.
pub async fn run_module(app: &AppConfig, registry: &ModuleRegistry, module: &str) -> Result<(), ServiceError> {
    let host = ModuleHost::bind(app, registry, module, None).await?;
    cancel_on_interrupt(host.shutdown_token());
    host.run().await;
    Ok(())
}
