//! Transport selection
//!
//! Builds the transport and interrupt registrar the records are bound to.

use std::sync::Arc;

use tracing::info;

use m3_comlink::{InterruptRegistrar, InterruptSource, M3Error, M3Transport, Result, WakeTarget};
use m3_protocols::seqdev::{GatewayParams, SimulatedTransport, TcpGatewayTransport};

use crate::config::{TransportConfig, TransportKind};

/// Registrar for links that cannot deliver I/O interrupts
#[derive(Debug, Default)]
pub struct NoInterrupts;

impl InterruptRegistrar for NoInterrupts {
    fn register(&self, source: InterruptSource, _wake: WakeTarget) -> Result<()> {
        Err(M3Error::not_supported(format!(
            "interrupt {} not available on this transport",
            source
        )))
    }
}

#[derive(Clone)]
pub struct Backend {
    pub transport: Arc<dyn M3Transport>,
    pub registrar: Arc<dyn InterruptRegistrar>,
    /// Set when the module image is in-process
    pub simulator: Option<Arc<SimulatedTransport>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("transport", &self.transport.name())
            .field("simulated", &self.simulator.is_some())
            .finish()
    }
}

impl Backend {
    pub fn from_config(config: &TransportConfig) -> Self {
        match config.kind {
            TransportKind::Simulated => {
                Self::simulated(Arc::new(SimulatedTransport::new(config.local_slot)))
            },
            TransportKind::Tcp => {
                let transport = TcpGatewayTransport::new(GatewayParams {
                    host: config.host.clone(),
                    port: config.port,
                    local_slot: config.local_slot,
                    connect_timeout: config.connect_timeout(),
                });
                info!("Transport: {}", transport.name());
                Self {
                    transport: Arc::new(transport),
                    registrar: Arc::new(NoInterrupts),
                    simulator: None,
                }
            },
        }
    }

    pub fn simulated(sim: Arc<SimulatedTransport>) -> Self {
        info!("Transport: {}", sim.name());
        Self {
            transport: sim.clone(),
            registrar: sim.clone(),
            simulator: Some(sim),
        }
    }
}
