//! Service assembly: devices, pollers and the shared rendezvous listener

pub mod poller;
pub mod reconnect;

use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StationsrvConfig;
use crate::connector::RendezvousListener;
use crate::error::Result;
use crate::sink::{MeasurementSink, StatusSink};
use crate::station::{Device, DeviceRegistry};

pub use poller::DevicePoller;
pub use reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy, ReconnectStats};

/// Running service: one poller per configured device
pub struct StationService {
    registry: Arc<DeviceRegistry>,
    rendezvous: Option<Arc<RendezvousListener>>,
    pollers: Vec<JoinHandle<()>>,
}

impl StationService {
    /// Build every device from `config` and spawn its poller
    pub async fn start(
        config: &StationsrvConfig,
        measurements: Arc<dyn MeasurementSink>,
        status: Arc<dyn StatusSink>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let rendezvous = if config.rendezvous.enabled {
            Some(
                RendezvousListener::start(
                    &config.rendezvous.bind,
                    config.rendezvous.settings(),
                    cancel.child_token(),
                )
                .await?,
            )
        } else {
            None
        };

        let registry = Arc::new(DeviceRegistry::new());
        let settings = config.device_settings();
        let mut pollers = Vec::with_capacity(config.devices.len());

        for dc in &config.devices {
            let mut device = Device::new(&dc.name, &dc.address, dc.slave_id, settings.clone());
            if let Some(listener) = &rendezvous {
                device = device.with_rendezvous(Arc::clone(listener));
            }
            let device = registry.insert(device)?;
            let interval = config.polling_interval(dc);
            info!("Device {} at {} every {:?}", dc.name, dc.address, interval);

            let poller = DevicePoller::new(
                device,
                interval,
                Arc::clone(&measurements),
                Arc::clone(&status),
            );
            pollers.push(poller.spawn(cancel.child_token()));
        }

        Ok(Self {
            registry,
            rendezvous,
            pollers,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn rendezvous(&self) -> Option<&Arc<RendezvousListener>> {
        self.rendezvous.as_ref()
    }

    /// Wait for every poller to finish (after cancellation)
    pub async fn join(self) {
        for result in join_all(self.pollers).await {
            if let Err(e) = result {
                warn!("Poller task ended abnormally: {}", e);
            }
        }
    }
}
