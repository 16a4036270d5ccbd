use super::{DiscoveredDevice, Notifications, Transport, TransportError, WriteMode, NOTIFICATION_BUFFER};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

const UNSET_ADDRESS: &str = "00:00:00:00:00:00";

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        TransportError::Backend(err.to_string())
    }
}

struct Link {
    peripheral: Peripheral,
    characteristic: Characteristic,
    forwarder: Option<JoinHandle<()>>,
}

/// BLE link backed by `btleplug`, using the first adapter found.
pub struct BtleTransport {
    adapter: Adapter,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    discovered: Vec<Peripheral>,
    link: Option<Link>,
}

impl BtleTransport {
    pub async fn new(service_uuid: &str, characteristic_uuid: &str) -> Result<Self, TransportError> {
        let service_uuid = parse_uuid(service_uuid)?;
        let characteristic_uuid = parse_uuid(characteristic_uuid)?;
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        Ok(Self {
            adapter,
            service_uuid,
            characteristic_uuid,
            discovered: Vec::new(),
            link: None,
        })
    }

    fn link(&self) -> Result<&Link, TransportError> {
        self.link.as_ref().ok_or(TransportError::NotConnected)
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(raw.trim())
        .map_err(|err| TransportError::Backend(format!("invalid uuid {raw}: {err}")))
}

// macOS reports CoreBluetooth UUIDs instead of MAC addresses, so a device is
// matched on either form.
fn peripheral_address(peripheral: &Peripheral) -> String {
    let address = peripheral.address().to_string();
    if address == UNSET_ADDRESS {
        peripheral.id().to_string()
    } else {
        address
    }
}

/// Runs `release` before handing back a setup error, so a peripheral
/// connected by this attempt is not left open.
async fn release_on_error<T, F, Fut>(
    result: Result<T, btleplug::Error>,
    release: F,
) -> Result<T, TransportError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), btleplug::Error>>,
{
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            if let Err(release_err) = release().await {
                tracing::debug!(error = %release_err, "failed to disconnect after setup error");
            }
            Err(err.into())
        }
    }
}

/// Pumps notification values into `tx` until the value stream ends or the
/// adapter reports the peripheral gone. Returning drops `tx`, which the
/// session reads as link loss.
async fn forward_until_disconnected<V, D>(values: V, disconnected: D, tx: mpsc::Sender<Vec<u8>>)
where
    V: Stream<Item = Vec<u8>>,
    D: Stream<Item = ()>,
{
    tokio::pin!(values);
    tokio::pin!(disconnected);
    let mut watching_adapter = true;
    loop {
        tokio::select! {
            value = values.next() => match value {
                Some(value) => {
                    if tx.send(value).await.is_err() {
                        break;
                    }
                }
                None => {
                    tracing::debug!("notification stream ended");
                    break;
                }
            },
            event = disconnected.next(), if watching_adapter => match event {
                Some(()) => {
                    tracing::debug!("adapter reported peripheral disconnected");
                    break;
                }
                None => watching_adapter = false,
            },
        }
    }
}

impl Transport for BtleTransport {
    async fn discover(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(timeout).await;
        if let Err(err) = self.adapter.stop_scan().await {
            tracing::debug!(error = %err, "failed to stop scan cleanly");
        }

        self.discovered = self.adapter.peripherals().await?;
        let mut devices = Vec::with_capacity(self.discovered.len());
        for peripheral in &self.discovered {
            let properties = peripheral.properties().await?;
            devices.push(DiscoveredDevice {
                address: peripheral_address(peripheral),
                name: properties.as_ref().and_then(|p| p.local_name.clone()),
                rssi: properties.as_ref().and_then(|p| p.rssi),
            });
        }
        tracing::debug!(count = devices.len(), "scan finished");
        Ok(devices)
    }

    async fn connect(&mut self, address: &str) -> Result<(), TransportError> {
        let peripheral = self
            .discovered
            .iter()
            .find(|p| peripheral_address(p).eq_ignore_ascii_case(address))
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(address.to_string()))?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        release_on_error(peripheral.discover_services().await, || {
            peripheral.disconnect()
        })
        .await?;

        let characteristic = match peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == self.service_uuid && c.uuid == self.characteristic_uuid)
        {
            Some(characteristic) => characteristic,
            None => {
                if let Err(err) = peripheral.disconnect().await {
                    tracing::debug!(error = %err, "failed to disconnect after missing characteristic");
                }
                return Err(TransportError::MissingCharacteristic(
                    self.characteristic_uuid.to_string(),
                ));
            }
        };

        self.link = Some(Link {
            peripheral,
            characteristic,
            forwarder: None,
        });
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<Notifications, TransportError> {
        let link = self.link.as_mut().ok_or(TransportError::NotConnected)?;
        let central_events = self.adapter.events().await?;
        let stream = link.peripheral.notifications().await?;
        link.peripheral.subscribe(&link.characteristic).await?;

        let expected = link.characteristic.uuid;
        let values = stream.filter_map(move |n| (n.uuid == expected).then_some(n.value));
        let peripheral_id = link.peripheral.id();
        let disconnected = central_events.filter_map(move |event| match event {
            CentralEvent::DeviceDisconnected(id) if id == peripheral_id => Some(()),
            _ => None,
        });

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        link.forwarder = Some(tokio::spawn(forward_until_disconnected(
            values,
            disconnected,
            tx,
        )));
        Ok(rx)
    }

    async fn write(&mut self, payload: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let link = self.link()?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        link.peripheral
            .write(&link.characteristic, payload, write_type)
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        if let Some(forwarder) = link.forwarder {
            forwarder.abort();
        }
        link.peripheral.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setup_error_disconnects_before_returning() {
        let mut released = false;
        let result: Result<(), _> = release_on_error(Err(btleplug::Error::NotConnected), || {
            released = true;
            std::future::ready(Ok(()))
        })
        .await;
        assert!(matches!(result, Err(TransportError::Backend(_))));
        assert!(released);

        let mut released = false;
        let result = release_on_error(Ok(7), || {
            released = true;
            std::future::ready(Ok(()))
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert!(!released);
    }

    #[tokio::test]
    async fn forwards_values_until_the_stream_ends() {
        let (tx, mut rx) = mpsc::channel(4);
        let values = tokio_stream::iter(vec![b"WAIT_ACK:1".to_vec(), b"END".to_vec()]);
        forward_until_disconnected(values, tokio_stream::pending::<()>(), tx).await;

        assert_eq!(rx.recv().await, Some(b"WAIT_ACK:1".to_vec()));
        assert_eq!(rx.recv().await, Some(b"END".to_vec()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn adapter_disconnect_closes_the_channel_while_stream_is_open() {
        let (tx, mut rx) = mpsc::channel(4);
        let forwarder = tokio::spawn(forward_until_disconnected(
            tokio_stream::pending::<Vec<u8>>(),
            tokio_stream::iter(vec![()]),
            tx,
        ));

        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed, Ok(None));
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn ended_adapter_events_do_not_stop_forwarding() {
        let (tx, mut rx) = mpsc::channel(4);
        let values = tokio_stream::iter(vec![b"1.5,1,2,3".to_vec()]);
        forward_until_disconnected(values, tokio_stream::empty::<()>(), tx).await;

        assert_eq!(rx.recv().await, Some(b"1.5,1,2,3".to_vec()));
        assert_eq!(rx.recv().await, None);
    }
}
