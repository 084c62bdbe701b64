//! Test helpers: an in-memory [`CarSink`] and a CAR v1 decoder for
//! checking what the packer shipped.

use crate::{error::Error, send::CarSink};
use std::{
    io::Read,
    sync::{Arc, Mutex},
};

mod car;
pub use car::*;

/// A [`CarSink`] that buffers every uploaded CAR in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    cars: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemorySink {
    /// All CARs received so far, in upload order.
    pub fn cars(&self) -> Vec<Vec<u8>> {
        self.cars.lock().expect("sink mutex poisoned").clone()
    }
}

impl CarSink for MemorySink {
    fn post_car(&self, mut car: impl Read + Send + 'static, len: u64) -> Result<(), Error> {
        let mut bytes = Vec::with_capacity(len as usize);
        car.read_to_end(&mut bytes)
            .map_err(|e| Error::Sink(e.into()))?;
        if bytes.len() as u64 != len {
            return Err(Error::Sink(anyhow::anyhow!(
                "announced {len} bytes but received {}",
                bytes.len()
            )));
        }
        self.cars.lock().expect("sink mutex poisoned").push(bytes);
        Ok(())
    }
}
