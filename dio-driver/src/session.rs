//! Transport session consumed by [`IoDevice`](crate::IoDevice).
//!
//! A session exposes block reads of discrete inputs and coils plus single and
//! multiple coil writes. Every request fails either as a device-reported
//! exception (the request is refused, the link is fine) or as a link fault
//! (I/O error or timeout). Sessions never retry; retry policy lives in the
//! orchestrator.

use async_trait::async_trait;
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::{net::lookup_host, time::error::Elapsed, time::timeout};
use tokio_modbus::{
    client::{tcp, Client as _, Context, Reader, Writer},
    slave::Slave,
};
use tracing::debug;

use crate::types::READ_TIMEOUT_MS;

/// Modbus function codes used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    WriteSingleCoil = 0x05,
    WriteMultipleCoils = 0x0F,
}

impl IoFunction {
    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            IoFunction::ReadCoils => "ReadCoils",
            IoFunction::ReadDiscreteInputs => "ReadDiscreteInputs",
            IoFunction::WriteSingleCoil => "WriteSingleCoil",
            IoFunction::WriteMultipleCoils => "WriteMultipleCoils",
        }
    }
}

impl fmt::Display for IoFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.label(), self.code())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The device refused one request; the link is still usable.
    #[error("Modbus exception on {function}: unit={unit}, code={code}")]
    Exception {
        function: IoFunction,
        unit: u8,
        code: String,
    },
    #[error("Transport error on {function}: {reason}")]
    Link { function: IoFunction, reason: String },
    #[error("{function} timed out after {timeout:?}")]
    Timeout {
        function: IoFunction,
        timeout: Duration,
    },
    #[error("Connect error: {0}")]
    Connect(String),
}

impl SessionError {
    /// Whether the session must be torn down after this error.
    #[inline]
    pub fn is_link_fault(&self) -> bool {
        !matches!(self, SessionError::Exception { .. })
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Remote module address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id: 1,
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-session protocol settings applied right after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub read_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(READ_TIMEOUT_MS),
        }
    }
}

#[async_trait]
pub trait IoSession: Send {
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> SessionResult<Vec<bool>>;

    async fn read_coils(&mut self, address: u16, count: u16) -> SessionResult<Vec<bool>>;

    async fn write_single_coil(&mut self, address: u16, value: bool) -> SessionResult<()>;

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> SessionResult<()>;

    /// Best-effort close; errors are swallowed.
    async fn disconnect(&mut self);
}

#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: SessionOptions,
    ) -> SessionResult<Box<dyn IoSession>>;
}

/// Modbus TCP connector backed by `tokio-modbus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusTcpConnector;

#[async_trait]
impl SessionConnector for ModbusTcpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: SessionOptions,
    ) -> SessionResult<Box<dyn IoSession>> {
        let addr = lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| SessionError::Connect(format!("Failed to resolve {endpoint}: {e}")))?
            .next()
            .ok_or_else(|| SessionError::Connect(format!("No address found for {endpoint}")))?;

        let ctx = tcp::connect_slave(addr, Slave(endpoint.unit_id))
            .await
            .map_err(|e| SessionError::Connect(format!("Modbus TCP connect error: {e}")))?;

        debug!(%addr, unit = endpoint.unit_id, "Modbus TCP session opened");
        Ok(Box::new(ModbusTcpSession {
            ctx,
            unit: endpoint.unit_id,
            read_timeout: options.read_timeout,
        }))
    }
}

struct ModbusTcpSession {
    ctx: Context,
    unit: u8,
    read_timeout: Duration,
}

/// Fold the timeout layer and the two tokio-modbus error layers into one result.
fn settle<T>(
    function: IoFunction,
    unit: u8,
    read_timeout: Duration,
    outcome: Result<tokio_modbus::Result<T>, Elapsed>,
) -> SessionResult<T> {
    match outcome {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(code))) => Err(SessionError::Exception {
            function,
            unit,
            code: format!("{code:?}"),
        }),
        Ok(Err(e)) => Err(SessionError::Link {
            function,
            reason: e.to_string(),
        }),
        Err(_elapsed) => Err(SessionError::Timeout {
            function,
            timeout: read_timeout,
        }),
    }
}

#[async_trait]
impl IoSession for ModbusTcpSession {
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> SessionResult<Vec<bool>> {
        let outcome = timeout(
            self.read_timeout,
            self.ctx.read_discrete_inputs(address, count),
        )
        .await;
        settle(
            IoFunction::ReadDiscreteInputs,
            self.unit,
            self.read_timeout,
            outcome,
        )
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> SessionResult<Vec<bool>> {
        let outcome = timeout(self.read_timeout, self.ctx.read_coils(address, count)).await;
        settle(IoFunction::ReadCoils, self.unit, self.read_timeout, outcome)
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> SessionResult<()> {
        let outcome = timeout(
            self.read_timeout,
            self.ctx.write_single_coil(address, value),
        )
        .await;
        settle(
            IoFunction::WriteSingleCoil,
            self.unit,
            self.read_timeout,
            outcome,
        )
    }

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> SessionResult<()> {
        let outcome = timeout(
            self.read_timeout,
            self.ctx.write_multiple_coils(address, values),
        )
        .await;
        settle(
            IoFunction::WriteMultipleCoils,
            self.unit,
            self.read_timeout,
            outcome,
        )
    }

    async fn disconnect(&mut self) {
        let _ = timeout(Duration::from_secs(2), self.ctx.disconnect()).await;
    }
}
