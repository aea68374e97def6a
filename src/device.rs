//! Device handles
//!
//! A [`Device`] owns everything that belongs to one polled device: its value
//! store, its transport and its tier tasks. The [`Gateway`] owns all devices;
//! removing a device from it drains the device and releases its resources.

use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};

use crate::config::{DeviceConfig, PollingConfig};
use crate::decode::{encode, needs_current, Value};
use crate::error::{ConfigError, WriteError};
use crate::modbus::ModbusClient;
use crate::register::{Bank, Source};
use crate::scheduler::{DeviceModel, PollContext, Scheduler, SchedulerSettings};
use crate::store::{RegisterUpdate, Snapshot};
use crate::transport::Transport;

pub struct Device {
    ctx: Arc<PollContext>,
    scheduler: Scheduler,
}

impl Device {
    /// Start polling a compiled device over `transport`.
    pub fn start(
        id: impl Into<String>,
        model: DeviceModel,
        settings: SchedulerSettings,
        transport: Box<dyn Transport>,
        updates: broadcast::Sender<RegisterUpdate>,
    ) -> Self {
        let ctx = Arc::new(PollContext::new(id, model, settings, transport, updates));
        let scheduler = Scheduler::start(ctx.clone());
        info!(
            "Device {} started: {} registers in {} batches, {} derived",
            ctx.device_id,
            ctx.registers.len(),
            ctx.plan.len(),
            ctx.evaluator.len()
        );
        Self { ctx, scheduler }
    }

    pub fn id(&self) -> &str {
        &self.ctx.device_id
    }

    pub fn is_draining(&self) -> bool {
        self.scheduler.is_draining()
    }

    /// Last known value, status and update time of a register.
    pub async fn get_value(&self, name: &str) -> Option<Snapshot> {
        self.ctx.store.read().await.get(name)
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.ctx.store.read().await.snapshots()
    }

    /// Encode `value` and write it to a read-write register.
    ///
    /// Partial bit fields are merged into the register's current contents; the
    /// read and the write happen under one hold of the transport lock.
    pub async fn write_value(&self, name: &str, value: &Value) -> Result<(), WriteError> {
        let register = self
            .ctx
            .registers
            .get(name)
            .ok_or_else(|| WriteError::UnknownRegister(name.to_string()))?;
        let address = match register.source {
            Source::Direct {
                address,
                bank: Bank::ReadWrite,
            } => address,
            _ => return Err(WriteError::NotWritable(name.to_string())),
        };
        if self.is_draining() {
            return Err(WriteError::Draining(self.id().to_string()));
        }

        let timeout = self.ctx.settings.timeout;
        let mut guard = self.ctx.transport.lock().await;
        let transport = match guard.as_mut() {
            Some(transport) if !self.is_draining() => transport,
            _ => return Err(WriteError::Draining(self.id().to_string())),
        };

        let current = if needs_current(&register.format) {
            let words = transport
                .read_range(Bank::ReadWrite, address, register.format.word_count, timeout)
                .await
                .map_err(|source| WriteError::ReadBack {
                    name: name.to_string(),
                    source,
                })?;
            Some(words)
        } else {
            None
        };

        let words = encode(value, &register.format, current.as_deref()).map_err(|source| {
            WriteError::Encode {
                name: name.to_string(),
                source,
            }
        })?;
        transport
            .write_words(Bank::ReadWrite, address, &words, timeout)
            .await
            .map_err(|source| WriteError::Transport {
                name: name.to_string(),
                source,
            })?;

        counter!("modpoller_writes_total", "device" => self.id().to_string()).increment(1);
        info!("Wrote {} = {} on device {}", name, value, self.id());
        Ok(())
    }

    /// Stop polling, wait for in-flight reads, then release the transport
    /// and every stored value.
    pub async fn drain(&self) {
        info!("Draining device {}", self.id());
        self.scheduler.drain().await;
        self.ctx.transport.lock().await.take();
        self.ctx.store.write().await.clear();
        info!("Device {} stopped", self.id());
    }
}

/// All devices of the running poller
pub struct Gateway {
    devices: RwLock<HashMap<String, Arc<Device>>>,
    updates: broadcast::Sender<RegisterUpdate>,
}

impl Gateway {
    pub fn new(updates: broadcast::Sender<RegisterUpdate>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegisterUpdate> {
        self.updates.subscribe()
    }

    /// Start a device over an already open transport, replacing any device
    /// with the same id.
    pub async fn add_device(
        &self,
        id: &str,
        model: DeviceModel,
        settings: SchedulerSettings,
        transport: Box<dyn Transport>,
    ) -> Result<(), ConfigError> {
        settings.validate()?;
        let device = Arc::new(Device::start(id, model, settings, transport, self.updates.clone()));
        let previous = self.devices.write().await.insert(id.to_string(), device);
        if let Some(previous) = previous {
            previous.drain().await;
        }
        Ok(())
    }

    /// Validate a configured device, connect to it and start polling.
    ///
    /// Configuration errors are reported before any connection is attempted
    /// and leave the device unscheduled.
    pub async fn connect_device(
        &self,
        config: &DeviceConfig,
        polling: &PollingConfig,
    ) -> anyhow::Result<()> {
        let (model, settings) = config
            .descriptors()
            .and_then(|descriptors| DeviceModel::compile(descriptors, polling.planner()))
            .and_then(|model| {
                config
                    .scheduler_settings(polling)
                    .map(|settings| (model, settings))
            })
            .map_err(|e| {
                error!("Device {} rejected: {}", config.id, e);
                e
            })?;
        let client = ModbusClient::connect(config).await?;
        self.add_device(&config.id, model, settings, Box::new(client))
            .await?;
        Ok(())
    }

    /// Drain and drop a device. Returns `false` if it was not known.
    pub async fn remove_device(&self, id: &str) -> bool {
        let removed = self.devices.write().await.remove(id);
        match removed {
            Some(device) => {
                device.drain().await;
                true
            }
            None => false,
        }
    }

    pub async fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(id).cloned()
    }

    /// Known device ids, sorted.
    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_value(&self, device: &str, name: &str) -> Option<Snapshot> {
        self.device(device).await?.get_value(name).await
    }

    pub async fn write_value(&self, device: &str, name: &str, value: &Value) -> Result<(), WriteError> {
        let handle = self
            .device(device)
            .await
            .ok_or_else(|| WriteError::UnknownDevice(device.to_string()))?;
        handle.write_value(name, value).await
    }

    /// Drain every device.
    pub async fn shutdown(&self) {
        let devices: Vec<Arc<Device>> = self.devices.write().await.drain().map(|(_, d)| d).collect();
        for device in devices {
            device.drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EncodeError, TransportError};
    use crate::planner::PlannerSettings;
    use crate::register::{BitExtraction, Encoding, Format, RegisterDescriptor};
    use crate::store::Status;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::MockTransport;
    use std::time::Duration;
    use tokio::sync::watch;

    fn registers() -> Vec<RegisterDescriptor> {
        vec![
            RegisterDescriptor::direct(
                "setpoint",
                10,
                Bank::ReadWrite,
                Format::new(Encoding::Int, 16).with_scale(0.1),
            ),
            RegisterDescriptor::direct(
                "mode",
                11,
                Bank::ReadWrite,
                Format::new(Encoding::UInt, 16).with_bits(BitExtraction::Range { start: 4, len: 3 }),
            ),
            RegisterDescriptor::direct(
                "energy",
                20,
                Bank::ReadWrite,
                Format::new(Encoding::UInt, 32).with_scale(0.01),
            ),
            RegisterDescriptor::direct("voltage", 0, Bank::ReadOnly, Format::new(Encoding::UInt, 16)),
        ]
    }

    fn device(transport: Box<dyn Transport>) -> Device {
        let (updates, _) = broadcast::channel(16);
        let model = DeviceModel::compile(registers(), PlannerSettings::default()).unwrap();
        Device::start("plc", model, SchedulerSettings::default(), transport, updates)
    }

    async fn poll_once(device: &Device) {
        let (_tx, drain) = watch::channel(false);
        device.ctx.poll_tier(crate::register::PollTier::Normal, &drain).await;
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips_within_precision() {
        let transport = MemoryTransport::new();
        let device = device(Box::new(transport.clone()));

        for value in [-12.3, 0.0, 21.7, 3276.7] {
            device.write_value("setpoint", &Value::Float(value)).await.unwrap();
            device.write_value("energy", &Value::Float(value.abs() * 10.0)).await.unwrap();
            poll_once(&device).await;

            let setpoint = device.get_value("setpoint").await.unwrap();
            assert_eq!(setpoint.status, Status::Fresh);
            let read = setpoint.value.and_then(|v| v.as_f64()).unwrap();
            assert!((read - value).abs() <= 0.1, "{read} vs {value}");

            let energy = device.get_value("energy").await.unwrap().value.unwrap();
            assert!((energy.as_f64().unwrap() - value.abs() * 10.0).abs() <= 0.01);
        }
        device.drain().await;
    }

    #[tokio::test]
    async fn test_bit_field_write_preserves_other_bits() {
        let transport = MemoryTransport::new();
        transport.set(Bank::ReadWrite, 11, &[0b1000_0000_1000_1111]);
        let device = device(Box::new(transport.clone()));

        device.write_value("mode", &Value::UInt(5)).await.unwrap();
        assert_eq!(transport.get(Bank::ReadWrite, 11), 0b1000_0000_1101_1111);

        poll_once(&device).await;
        assert_eq!(device.get_value("mode").await.unwrap().value, Some(Value::UInt(5)));
        device.drain().await;
    }

    #[tokio::test]
    async fn test_write_rejections() {
        let device = device(Box::new(MemoryTransport::new()));

        assert!(matches!(
            device.write_value("voltage", &Value::UInt(1)).await,
            Err(WriteError::NotWritable(_))
        ));
        assert!(matches!(
            device.write_value("missing", &Value::UInt(1)).await,
            Err(WriteError::UnknownRegister(_))
        ));
        assert!(matches!(
            device.write_value("mode", &Value::UInt(8)).await,
            Err(WriteError::Encode {
                source: EncodeError::OutOfRange { .. },
                ..
            })
        ));
        assert!(matches!(
            device.write_value("setpoint", &Value::Text("hot".into())).await,
            Err(WriteError::Encode { .. })
        ));

        device.drain().await;
        assert!(matches!(
            device.write_value("setpoint", &Value::Float(1.0)).await,
            Err(WriteError::Draining(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_write_failure_is_reported() {
        let mut mock = MockTransport::new();
        mock.expect_read_range()
            .returning(|_, _, count, _| Ok(vec![0; usize::from(count)]));
        mock.expect_write_words()
            .returning(|_, _, _, timeout| Err(TransportError::Timeout(timeout)));
        let device = device(Box::new(mock));

        let result = device.write_value("setpoint", &Value::Float(1.0)).await;
        assert!(matches!(
            result,
            Err(WriteError::Transport {
                source: TransportError::Timeout(_),
                ..
            })
        ));
        device.drain().await;
    }

    #[tokio::test]
    async fn test_gateway_routes_and_removes_devices() {
        let (updates, _) = broadcast::channel(16);
        let gateway = Gateway::new(updates);
        let transport = MemoryTransport::new();
        transport.set(Bank::ReadOnly, 0, &[230]);
        let model = DeviceModel::compile(registers(), PlannerSettings::default()).unwrap();
        let settings = SchedulerSettings {
            normal: Duration::from_millis(20),
            ..Default::default()
        };
        gateway
            .add_device("plc", model, settings, Box::new(transport.clone()))
            .await
            .unwrap();
        assert_eq!(gateway.device_ids().await, vec!["plc".to_string()]);

        let mut voltage = None;
        for _ in 0..50 {
            voltage = gateway.get_value("plc", "voltage").await.and_then(|s| s.value);
            if voltage.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(voltage, Some(Value::UInt(230)));

        gateway
            .write_value("plc", "setpoint", &Value::Float(2.5))
            .await
            .unwrap();
        assert_eq!(transport.get(Bank::ReadWrite, 10), 25);
        assert!(matches!(
            gateway.write_value("nope", "setpoint", &Value::Float(1.0)).await,
            Err(WriteError::UnknownDevice(_))
        ));

        let handle = gateway.device("plc").await.unwrap();
        assert!(gateway.remove_device("plc").await);
        assert!(!gateway.remove_device("plc").await);
        assert!(handle.is_draining());
        assert!(handle.get_value("voltage").await.is_none());
        assert!(handle.ctx.transport.lock().await.is_none());
        assert!(gateway.get_value("plc", "voltage").await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_config_is_not_scheduled() {
        let (updates, _) = broadcast::channel(1);
        let gateway = Gateway::new(updates);
        let config: DeviceConfig = serde_yaml::from_str(
            r#"
id: broken
connection:
  host: 127.0.0.1
  port: 1
registers:
  - name: a
    derive:
      sum: [b]
  - name: b
    derive:
      sum: [a]
"#,
        )
        .unwrap();
        let result = gateway.connect_device(&config, &PollingConfig::default()).await;
        let error = result.unwrap_err();
        assert!(error.downcast_ref::<ConfigError>().is_some());
        assert!(gateway.device_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected_before_scheduling() {
        let (updates, _) = broadcast::channel(1);
        let gateway = Gateway::new(updates);
        let model = DeviceModel::compile(registers(), PlannerSettings::default()).unwrap();
        let settings = SchedulerSettings {
            normal: Duration::ZERO,
            ..Default::default()
        };
        let result = gateway
            .add_device("plc", model, settings, Box::new(MemoryTransport::new()))
            .await;
        assert!(matches!(result, Err(ConfigError::ZeroDuration("normal_ms"))));
        assert!(gateway.device_ids().await.is_empty());

        let config: DeviceConfig = serde_yaml::from_str(
            r#"
id: fast-zero
connection:
  host: 127.0.0.1
  port: 1
intervals:
  fast_ms: 0
registers:
  - name: a
    address: 0
    bank: input
"#,
        )
        .unwrap();
        let error = gateway
            .connect_device(&config, &PollingConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ConfigError>(),
            Some(ConfigError::ZeroDuration("fast_ms"))
        ));
        assert!(gateway.device_ids().await.is_empty());
    }
}
