//! Driver event pump
//! Routes everything the driver reports into the registry and the
//! connection state machine from a single background task.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::connection::ConnectionStateMachine;
use crate::core::bluetooth::driver::DriverEvent;
use crate::core::bluetooth::events::EventBus;
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceRegistry};

/// Background task consuming a driver's event stream.
pub struct DriverEventPump {
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DriverEventPump {
    /// Starts pumping `events` until the stream ends or [`DriverEventPump::stop`] is called.
    pub fn spawn(
        events: BoxStream<'static, DriverEvent>,
        registry: Arc<DeviceRegistry>,
        bus: EventBus,
        machine: ConnectionStateMachine,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::process_events(
            events,
            registry,
            bus,
            machine,
            cancel_token.clone(),
        ));
        Self {
            cancel_token,
            handle: Some(handle),
        }
    }

    async fn process_events(
        mut events: BoxStream<'static, DriverEvent>,
        registry: Arc<DeviceRegistry>,
        bus: EventBus,
        machine: ConnectionStateMachine,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for driver events...");

        loop {
            tokio::select! {
                event = events.next() => {
                    match event {
                        Some(event) => Self::dispatch(&registry, &bus, &machine, event),
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }

        info!("Driver event stream ended");
    }

    /// Handles a single driver event synchronously.
    pub fn dispatch(
        registry: &DeviceRegistry,
        bus: &EventBus,
        machine: &ConnectionStateMachine,
        event: DriverEvent,
    ) {
        match event {
            DriverEvent::Advertisement(record) => {
                BluetoothScanner::ingest(registry, bus, record);
            }
            DriverEvent::Link { address, signal } => {
                debug!("Link signal for {}: {:?}", address, signal);
                machine.on_link_event(&address, signal);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the pump and waits for its task to finish.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Driver event task was cancelled.");
                } else {
                    error!("Driver event task finished with an unexpected join error: {:?}", e);
                }
            }
        }
    }
}

impl Drop for DriverEventPump {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
