//! Modbus protocol handling
//!
//! [`ModbusClient`] implements [`Transport`] on top of tokio-modbus. The
//! read-only bank maps to input registers (FC04), the read-write bank to
//! holding registers (FC03, FC06, FC16).

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::config::DeviceConfig;
use crate::error::TransportError;
use crate::register::Bank;
use crate::transport::{with_timeout, Transport};

pub mod client;

/// Modbus client for one device, TCP or RTU
pub struct ModbusClient {
    device_id: String,
    device_type: &'static str,
    context: Context,
}

impl ModbusClient {
    /// Create a new Modbus client from device configuration
    pub async fn connect(config: &DeviceConfig) -> Result<Self> {
        info!("Initializing Modbus client for device: {}", config.id);

        let (context, device_type) = client::connect(&config.connection).await?;

        info!(
            "Modbus {} client ready for device: {}",
            device_type, config.id
        );

        Ok(Self {
            device_id: config.id.clone(),
            device_type,
            context,
        })
    }
}

#[async_trait]
impl Transport for ModbusClient {
    async fn read_range(
        &mut self,
        bank: Bank,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError> {
        debug!(
            "Reading {} {} registers from address {} ({})",
            count, bank, start, self.device_type
        );
        let ctx = &mut self.context;
        let words = with_timeout(timeout, async move {
            match bank {
                Bank::ReadOnly => client::flatten(ctx.read_input_registers(start, count).await),
                Bank::ReadWrite => client::flatten(ctx.read_holding_registers(start, count).await),
            }
        })
        .await?;

        if words.len() != usize::from(count) {
            return Err(TransportError::ShortResponse {
                expected: usize::from(count),
                actual: words.len(),
            });
        }
        Ok(words)
    }

    async fn write_words(
        &mut self,
        bank: Bank,
        address: u16,
        words: &[u16],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        if bank == Bank::ReadOnly {
            return Err(TransportError::ReadOnlyBank(bank));
        }
        let ctx = &mut self.context;
        with_timeout(timeout, async move {
            match words {
                [single] => client::flatten(ctx.write_single_register(address, *single).await),
                _ => client::flatten(ctx.write_multiple_registers(address, words).await),
            }
        })
        .await?;

        info!(
            "Wrote {} registers starting at {} on device {} ({})",
            words.len(),
            address,
            self.device_id,
            self.device_type
        );
        Ok(())
    }
}
