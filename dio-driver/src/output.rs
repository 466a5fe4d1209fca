use tracing::debug;

use crate::{
    device::IoDevice,
    error::{DeviceError, DeviceResult},
};

impl IoDevice {
    /// Drive one coil. The stored status is updated before the write goes out;
    /// a refused write is logged, a link fault closes the session.
    pub async fn change_coil_status(&self, index: u16, value: bool) -> DeviceResult<()> {
        let address = {
            self.ensure_ready()?;
            let mut table = self.write_table();
            let base = table.geometry.coil_address;
            table.coil_mut(index)?.status = value;
            base + index
        };
        let Some(session) = self.session.load_full() else {
            return Err(DeviceError::NotConnected(self.name.to_string()));
        };
        debug!(device = %self.name, index, value, "Write coil");
        let outcome = session.lock().await.write_single_coil(address, value).await;
        if let Err(e) = outcome {
            self.handle_session_error(&e);
        }
        Ok(())
    }

    /// Drive the coil block from its first coil, one value per coil.
    pub async fn change_coils_status(&self, values: &[bool]) -> DeviceResult<()> {
        let address = {
            self.ensure_ready()?;
            let mut table = self.write_table();
            let count = table.coils.len();
            if values.is_empty() || values.len() > count {
                return Err(DeviceError::ConfigurationError(format!(
                    "Expected 1..={count} coil values, got {}",
                    values.len()
                )));
            }
            for (coil, value) in table.coils.iter_mut().zip(values) {
                coil.status = *value;
            }
            table.geometry.coil_address
        };
        self.write_coil_block(address, values).await;
        Ok(())
    }

    pub(crate) async fn write_coil_block(&self, address: u16, values: &[bool]) {
        let Some(session) = self.session.load_full() else {
            return;
        };
        let outcome = session
            .lock()
            .await
            .write_multiple_coils(address, values)
            .await;
        if let Err(e) = outcome {
            self.handle_session_error(&e);
        }
    }
}
