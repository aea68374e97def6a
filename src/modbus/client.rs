//! Modbus connection setup
//!
//! Supports both TCP and RTU (serial) connections

use anyhow::{Context as AnyhowContext, Result};
use std::net::SocketAddr;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, RtuConnection, TcpConnection};
use crate::error::TransportError;

/// Open the connection described by `config`. Returns the context and a
/// short label of the link type for logging.
pub async fn connect(config: &ConnectionConfig) -> Result<(Context, &'static str)> {
    match config {
        ConnectionConfig::Tcp(tcp) => Ok((connect_tcp(tcp).await?, "TCP")),
        ConnectionConfig::Rtu(rtu) => Ok((open_rtu(rtu)?, "RTU")),
    }
}

async fn connect_tcp(tcp: &TcpConnection) -> Result<Context> {
    let addr: SocketAddr = tokio::net::lookup_host((tcp.host.as_str(), tcp.port))
        .await
        .with_context(|| format!("Invalid TCP address {}:{}", tcp.host, tcp.port))?
        .next()
        .with_context(|| format!("No address found for {}", tcp.host))?;

    info!("Connecting to Modbus TCP: {} (unit {})", addr, tcp.unit_id);

    tcp::connect_slave(addr, Slave(tcp.unit_id))
        .await
        .with_context(|| format!("Failed to connect to {}", addr))
}

fn open_rtu(rtu: &RtuConnection) -> Result<Context> {
    info!(
        "Connecting to Modbus RTU: {} @ {} baud (unit {})",
        rtu.port, rtu.baud_rate, rtu.unit_id
    );

    let parity = parse_parity(&rtu.parity);
    let stop_bits = parse_stop_bits(rtu.stop_bits);
    let data_bits = parse_data_bits(rtu.data_bits);

    let port = tokio_serial::new(&rtu.port, rtu.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits)
        .open_native_async()
        .with_context(|| {
            format!(
                "Failed to open serial port {} at {} baud",
                rtu.port, rtu.baud_rate
            )
        })?;

    info!(
        "Serial port {} opened: {} baud, {} data bits, {:?} parity, {:?} stop bits",
        rtu.port, rtu.baud_rate, rtu.data_bits, parity, stop_bits
    );

    Ok(rtu::attach_slave(port, Slave(rtu.unit_id)))
}

pub(crate) fn parse_parity(parity: &str) -> tokio_serial::Parity {
    match parity.to_lowercase().as_str() {
        "none" => tokio_serial::Parity::None,
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => {
            warn!("Unknown parity '{}', using None", parity);
            tokio_serial::Parity::None
        }
    }
}

pub(crate) fn parse_stop_bits(stop_bits: u8) -> tokio_serial::StopBits {
    match stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        _ => {
            warn!("Unknown stop bits {}, using 1", stop_bits);
            tokio_serial::StopBits::One
        }
    }
}

pub(crate) fn parse_data_bits(data_bits: u8) -> tokio_serial::DataBits {
    match data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        _ => {
            warn!("Unknown data bits {}, using 8", data_bits);
            tokio_serial::DataBits::Eight
        }
    }
}

/// Flatten tokio-modbus's nested result into a [`TransportError`].
pub(crate) fn flatten<T>(
    result: Result<Result<T, tokio_modbus::Exception>, tokio_modbus::Error>,
) -> Result<T, TransportError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(TransportError::Exception(exception.to_string())),
        Err(tokio_modbus::Error::Transport(e)) => Err(TransportError::Io(e)),
        Err(e) => Err(TransportError::Protocol(e.to_string())),
    }
}
