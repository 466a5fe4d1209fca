//! In-memory discrete-I/O module.
//!
//! Implements the session traits over shared vectors so the engine can be
//! driven without hardware. Faults are injected per function: a queued
//! fault is consumed by the next matching request. Latency is also set per
//! function and applies to every request until changed.

use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::sleep;

use crate::session::{
    Endpoint, IoFunction, IoSession, SessionConnector, SessionError, SessionOptions, SessionResult,
};

/// Fault injected into the next request of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// Device-reported refusal, the session stays usable.
    Exception,
    /// Broken link, the session is unusable afterwards.
    Link,
}

/// A write observed by the module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoilWrite {
    pub function: IoFunction,
    pub address: u16,
    pub values: Vec<bool>,
}

#[derive(Debug, Default)]
struct ModuleState {
    inputs: Vec<bool>,
    coils: Vec<bool>,
    refuse_connect: bool,
    generation: u64,
    connects: usize,
    faults: HashMap<IoFunction, VecDeque<MemoryFault>>,
    latency: HashMap<IoFunction, Duration>,
    writes: Vec<CoilWrite>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryModule {
    state: Arc<Mutex<ModuleState>>,
}

impl MemoryModule {
    /// Module with inputs and coils addressed from zero.
    pub fn new(input_count: u16, coil_count: u16) -> Self {
        let state = ModuleState {
            inputs: vec![false; usize::from(input_count)],
            coils: vec![false; usize::from(coil_count)],
            ..ModuleState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_input(&self, index: u16, value: bool) {
        if let Some(slot) = self.lock().inputs.get_mut(usize::from(index)) {
            *slot = value;
        }
    }

    pub fn inputs(&self) -> Vec<bool> {
        self.lock().inputs.clone()
    }

    pub fn coils(&self) -> Vec<bool> {
        self.lock().coils.clone()
    }

    pub fn coil(&self, index: u16) -> Option<bool> {
        self.lock().coils.get(usize::from(index)).copied()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn push_fault(&self, function: IoFunction, fault: MemoryFault) {
        self.lock()
            .faults
            .entry(function)
            .or_default()
            .push_back(fault);
    }

    /// Delay every later request of `function`; zero removes the delay.
    pub fn set_latency(&self, function: IoFunction, latency: Duration) {
        let mut state = self.lock();
        if latency.is_zero() {
            state.latency.remove(&function);
        } else {
            state.latency.insert(function, latency);
        }
    }

    /// Break every open session; later requests on them fail as link faults.
    pub fn sever_sessions(&self) {
        self.lock().generation += 1;
    }

    pub fn coil_writes(&self) -> Vec<CoilWrite> {
        self.lock().writes.clone()
    }
}

#[async_trait]
impl SessionConnector for MemoryModule {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        _options: SessionOptions,
    ) -> SessionResult<Box<dyn IoSession>> {
        let mut state = self.lock();
        if state.refuse_connect {
            return Err(SessionError::Connect(format!("{endpoint} refused the connection")));
        }
        state.connects += 1;
        Ok(Box::new(MemorySession {
            module: self.clone(),
            generation: state.generation,
            unit: endpoint.unit_id,
        }))
    }
}

struct MemorySession {
    module: MemoryModule,
    generation: u64,
    unit: u8,
}

impl MemorySession {
    async fn respond_after_latency(&self, function: IoFunction) {
        let latency = self.module.lock().latency.get(&function).copied();
        if let Some(latency) = latency {
            sleep(latency).await;
        }
    }

    /// Apply injected faults and range checks, then hand the state over.
    fn request<T>(
        &self,
        function: IoFunction,
        address: u16,
        count: usize,
        op: impl FnOnce(&mut ModuleState, usize) -> T,
    ) -> SessionResult<T> {
        let mut state = self.module.lock();
        if state.generation != self.generation {
            return Err(SessionError::Link {
                function,
                reason: "session severed".into(),
            });
        }
        let injected = state
            .faults
            .get_mut(&function)
            .and_then(|queue| queue.pop_front());
        match injected {
            Some(MemoryFault::Link) => {
                // A broken link stays broken for this session.
                state.generation += 1;
                return Err(SessionError::Link {
                    function,
                    reason: "connection reset".into(),
                });
            }
            Some(MemoryFault::Exception) => {
                return Err(self.exception(function, "ServerDeviceFailure"));
            }
            None => {}
        }

        let start = usize::from(address);
        let len = match function {
            IoFunction::ReadDiscreteInputs => state.inputs.len(),
            _ => state.coils.len(),
        };
        if count == 0 || start + count > len {
            return Err(self.exception(function, "IllegalDataAddress"));
        }
        Ok(op(&mut *state, start))
    }

    fn exception(&self, function: IoFunction, code: &str) -> SessionError {
        SessionError::Exception {
            function,
            unit: self.unit,
            code: code.to_string(),
        }
    }
}

#[async_trait]
impl IoSession for MemorySession {
    async fn read_discrete_inputs(&mut self, address: u16, count: u16) -> SessionResult<Vec<bool>> {
        self.respond_after_latency(IoFunction::ReadDiscreteInputs).await;
        let count = usize::from(count);
        self.request(IoFunction::ReadDiscreteInputs, address, count, |state, start| {
            state.inputs[start..start + count].to_vec()
        })
    }

    async fn read_coils(&mut self, address: u16, count: u16) -> SessionResult<Vec<bool>> {
        self.respond_after_latency(IoFunction::ReadCoils).await;
        let count = usize::from(count);
        self.request(IoFunction::ReadCoils, address, count, |state, start| {
            state.coils[start..start + count].to_vec()
        })
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> SessionResult<()> {
        self.respond_after_latency(IoFunction::WriteSingleCoil).await;
        self.request(IoFunction::WriteSingleCoil, address, 1, |state, start| {
            state.coils[start] = value;
            state.writes.push(CoilWrite {
                function: IoFunction::WriteSingleCoil,
                address,
                values: vec![value],
            });
        })
    }

    async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> SessionResult<()> {
        self.respond_after_latency(IoFunction::WriteMultipleCoils).await;
        self.request(
            IoFunction::WriteMultipleCoils,
            address,
            values.len(),
            |state, start| {
                state.coils[start..start + values.len()].copy_from_slice(values);
                state.writes.push(CoilWrite {
                    function: IoFunction::WriteMultipleCoils,
                    address,
                    values: values.to_vec(),
                });
            },
        )
    }

    async fn disconnect(&mut self) {}
}
