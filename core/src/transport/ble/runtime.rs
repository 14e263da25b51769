/// Role runtimes: one task per role, commands in, events out
///
/// Each controller runs inside its own tokio task. Callers hold a cloneable
/// handle that sends commands carrying a reply channel; the platform posts
/// radio events into the role's inbox. Both are consumed by the same loop, so
/// a controller only ever sees one input at a time.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::central::{CentralController, PeerRecord};
use super::peripheral::{PeripheralController, SubscriberRecord};
use super::radio::{CentralEvent, PeripheralEvent, RadioEventReceiver};
use crate::MessagingError;

type Reply<T> = oneshot::Sender<T>;

pub enum PeripheralCommand {
    StartAdvertising {
        service_uuid: String,
        reply: Reply<Result<(), MessagingError>>,
    },
    StopAdvertising {
        reply: Reply<()>,
    },
    SendMessage {
        to: String,
        message: String,
        reply: Reply<Result<(), MessagingError>>,
    },
    IsAdvertising {
        reply: Reply<bool>,
    },
    Subscribers {
        reply: Reply<Vec<SubscriberRecord>>,
    },
    Cleanup {
        reply: Reply<()>,
    },
    Shutdown,
}

pub enum CentralCommand {
    StartScan {
        service_uuid: String,
        timeout: Option<Duration>,
        reply: Reply<Result<(), MessagingError>>,
    },
    StopScan {
        reply: Reply<Result<(), MessagingError>>,
    },
    Connect {
        peer_id: String,
        reply: Reply<Result<(), MessagingError>>,
    },
    Disconnect {
        peer_id: String,
        reply: Reply<Result<(), MessagingError>>,
    },
    SendMessage {
        to: String,
        message: String,
        reply: Reply<Result<(), MessagingError>>,
    },
    IsScanning {
        reply: Reply<bool>,
    },
    DiscoveredPeers {
        reply: Reply<Vec<PeerRecord>>,
    },
    Cleanup {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Handle to a running peripheral role
#[derive(Clone)]
pub struct PeripheralHandle {
    command_tx: mpsc::Sender<PeripheralCommand>,
}

impl PeripheralHandle {
    /// Resolves once the adapter state decides the request
    pub async fn start_advertising(&self, service_uuid: &str) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PeripheralCommand::StartAdvertising {
            service_uuid: service_uuid.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn stop_advertising(&self) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PeripheralCommand::StopAdvertising { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    pub async fn send_message(&self, to: &str, message: &str) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PeripheralCommand::SendMessage {
            to: to.to_string(),
            message: message.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn is_advertising(&self) -> Result<bool, MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PeripheralCommand::IsAdvertising { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    pub async fn subscribers(&self) -> Result<Vec<SubscriberRecord>, MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PeripheralCommand::Subscribers { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    pub async fn cleanup(&self) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(PeripheralCommand::Cleanup { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    /// Clean up and stop the task. Pending requests fail with `RuntimeStopped`.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(PeripheralCommand::Shutdown).await;
    }

    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    async fn send(&self, command: PeripheralCommand) -> Result<(), MessagingError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MessagingError::RuntimeStopped)
    }
}

/// Handle to a running central role
#[derive(Clone)]
pub struct CentralHandle {
    command_tx: mpsc::Sender<CentralCommand>,
}

impl CentralHandle {
    /// Resolves once the adapter state decides the request. `timeout` of
    /// `None` uses the configured default, zero scans until stopped.
    pub async fn start_scan(
        &self,
        service_uuid: &str,
        timeout: Option<Duration>,
    ) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::StartScan {
            service_uuid: service_uuid.to_string(),
            timeout,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn stop_scan(&self) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::StopScan { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn connect(&self, peer_id: &str) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::Connect {
            peer_id: peer_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn disconnect(&self, peer_id: &str) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::Disconnect {
            peer_id: peer_id.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn send_message(&self, to: &str, message: &str) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::SendMessage {
            to: to.to_string(),
            message: message.to_string(),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)?
    }

    pub async fn is_scanning(&self) -> Result<bool, MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::IsScanning { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    pub async fn discovered_peers(&self) -> Result<Vec<PeerRecord>, MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::DiscoveredPeers { reply: reply_tx })
            .await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    pub async fn cleanup(&self) -> Result<(), MessagingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(CentralCommand::Cleanup { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| MessagingError::RuntimeStopped)
    }

    /// Clean up and stop the task. Pending requests fail with `RuntimeStopped`.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(CentralCommand::Shutdown).await;
    }

    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    async fn send(&self, command: CentralCommand) -> Result<(), MessagingError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| MessagingError::RuntimeStopped)
    }
}

/// Run `controller` on a new task. Must be called inside a tokio runtime.
pub fn spawn_peripheral(
    controller: PeripheralController,
    mut events: RadioEventReceiver<PeripheralEvent>,
    command_buffer: usize,
) -> PeripheralHandle {
    let (command_tx, mut command_rx) = mpsc::channel(command_buffer.max(1));

    tokio::spawn(async move {
        let mut controller = controller;
        info!("Peripheral runtime started");

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(PeripheralCommand::Shutdown) | None => break,
                        Some(command) => handle_peripheral_command(&mut controller, command),
                    }
                }
                Some(event) = events.recv() => {
                    controller.handle_event(event);
                }
            }
        }

        controller.abort_pending(MessagingError::RuntimeStopped);
        controller.cleanup();
        info!("Peripheral runtime stopped");
    });

    PeripheralHandle { command_tx }
}

fn handle_peripheral_command(controller: &mut PeripheralController, command: PeripheralCommand) {
    match command {
        PeripheralCommand::StartAdvertising {
            service_uuid,
            reply,
        } => controller.start_advertising(&service_uuid, reply),
        PeripheralCommand::StopAdvertising { reply } => {
            controller.stop_advertising();
            let _ = reply.send(());
        }
        PeripheralCommand::SendMessage { to, message, reply } => {
            let _ = reply.send(controller.send_message(&to, message));
        }
        PeripheralCommand::IsAdvertising { reply } => {
            let _ = reply.send(controller.is_advertising());
        }
        PeripheralCommand::Subscribers { reply } => {
            let _ = reply.send(controller.subscribers());
        }
        PeripheralCommand::Cleanup { reply } => {
            controller.cleanup();
            let _ = reply.send(());
        }
        PeripheralCommand::Shutdown => {}
    }
}

/// Run `controller` on a new task. Must be called inside a tokio runtime.
pub fn spawn_central(
    controller: CentralController,
    mut events: RadioEventReceiver<CentralEvent>,
    command_buffer: usize,
) -> CentralHandle {
    let (command_tx, mut command_rx) = mpsc::channel(command_buffer.max(1));
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel::<u64>();

    tokio::spawn(async move {
        let mut controller = controller;
        info!("Central runtime started");

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(CentralCommand::Shutdown) | None => break,
                        Some(command) => handle_central_command(&mut controller, command),
                    }
                }
                Some(event) = events.recv() => {
                    controller.handle_event(event);
                }
                Some(generation) = timer_rx.recv() => {
                    controller.on_scan_timeout(generation);
                }
            }

            if let Some(timer) = controller.take_scan_timer() {
                debug!("Scan {} auto-stops in {:?}", timer.generation, timer.after);
                let timer_tx = timer_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timer.after).await;
                    let _ = timer_tx.send(timer.generation);
                });
            }
        }

        controller.abort_pending(MessagingError::RuntimeStopped);
        controller.cleanup();
        info!("Central runtime stopped");
    });

    CentralHandle { command_tx }
}

fn handle_central_command(controller: &mut CentralController, command: CentralCommand) {
    match command {
        CentralCommand::StartScan {
            service_uuid,
            timeout,
            reply,
        } => controller.start_scan(&service_uuid, timeout, reply),
        CentralCommand::StopScan { reply } => {
            let _ = reply.send(controller.stop_scan());
        }
        CentralCommand::Connect { peer_id, reply } => {
            let _ = reply.send(controller.connect(&peer_id));
        }
        CentralCommand::Disconnect { peer_id, reply } => {
            let _ = reply.send(controller.disconnect(&peer_id));
        }
        CentralCommand::SendMessage { to, message, reply } => {
            let _ = reply.send(controller.send_message(&to, message));
        }
        CentralCommand::IsScanning { reply } => {
            let _ = reply.send(controller.is_scanning());
        }
        CentralCommand::DiscoveredPeers { reply } => {
            let _ = reply.send(controller.discovered_peers());
        }
        CentralCommand::Cleanup { reply } => {
            controller.cleanup();
            let _ = reply.send(());
        }
        CentralCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingConfig;
    use crate::transport::ble::events::RecordingSink;
    use crate::transport::ble::gate::AdapterState;
    use crate::transport::ble::radio::{radio_event_channel, CentralRadio, RadioError};
    use uuid::Uuid;

    struct IdleCentralRadio;

    impl CentralRadio for IdleCentralRadio {
        fn start_scan(&mut self, _service: Uuid, _dup: bool) -> Result<(), RadioError> {
            Ok(())
        }
        fn stop_scan(&mut self) -> Result<(), RadioError> {
            Ok(())
        }
        fn connect(&mut self, _peer_id: &str) -> Result<(), RadioError> {
            Ok(())
        }
        fn cancel_connection(&mut self, _peer_id: &str) -> Result<(), RadioError> {
            Ok(())
        }
        fn discover_services(&mut self, _peer_id: &str, _service: Uuid) -> Result<(), RadioError> {
            Ok(())
        }
        fn discover_characteristics(
            &mut self,
            _peer_id: &str,
            _service: Uuid,
            _characteristic: Uuid,
        ) -> Result<(), RadioError> {
            Ok(())
        }
        fn set_notify(
            &mut self,
            _peer_id: &str,
            _characteristic: Uuid,
            _enabled: bool,
        ) -> Result<(), RadioError> {
            Ok(())
        }
        fn write_without_response(&mut self, _peer_id: &str, _c: Uuid, _value: &[u8]) -> bool {
            true
        }
    }

    fn central() -> (
        CentralHandle,
        crate::transport::ble::radio::RadioEventSender<CentralEvent>,
        std::sync::Arc<RecordingSink>,
    ) {
        let sink = RecordingSink::new();
        let (events_tx, events_rx) = radio_event_channel();
        let controller = CentralController::new(
            &MessagingConfig::default(),
            Box::new(IdleCentralRadio),
            sink.clone(),
        );
        (spawn_central(controller, events_rx, 8), events_tx, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_auto_stops_after_timeout() {
        let (handle, events, sink) = central();
        events.post(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));

        handle
            .start_scan("180D", Some(Duration::from_secs(5)))
            .await
            .expect("scan starts");
        assert!(handle.is_scanning().await.unwrap());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!handle.is_scanning().await.unwrap());
        assert_eq!(sink.count("onScanStopped"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_waits_for_adapter() {
        let (handle, events, _sink) = central();
        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.start_scan("180D", None).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        events.post(CentralEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(
            pending.await.unwrap(),
            Err(MessagingError::RadioUnavailable)
        );
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let (handle, _events, _sink) = central();
        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.start_scan("180D", None).await })
        };
        tokio::task::yield_now().await;

        handle.shutdown().await;
        assert_eq!(pending.await.unwrap(), Err(MessagingError::RuntimeStopped));
        assert_eq!(
            handle.stop_scan().await,
            Err(MessagingError::RuntimeStopped)
        );
    }
}
