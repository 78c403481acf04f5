//! Errors raised by parameter isolation and validation.

use crate::blas::Operand;
use gemmtune_device::DeviceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamsError {
    /// Device memory could not be obtained for an isolated copy.
    #[error("failed to allocate {bytes} bytes for operand {operand}")]
    Allocation {
        operand: Operand,
        bytes: usize,
        #[source]
        source: DeviceError,
    },

    /// The asynchronous copy of an operand could not be enqueued.
    #[error("failed to enqueue copy of operand {operand} ({bytes} bytes)")]
    Copy {
        operand: Operand,
        bytes: usize,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Caller bug: releasing foreign buffers, malformed shapes.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

impl ParamsError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, ParamsError::ContractViolation(_))
    }
}
