use crate::types::DeviceState;

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("device manager is already initialized")]
    AlreadyInitialized,

    #[error("device manager is not initialized")]
    NotInitialized,

    #[error("invalid device serial '{0}'")]
    InvalidSerial(String),

    #[error("cannot parse an emulator port from serial '{0}'")]
    InvalidEmulatorPort(String),

    #[error("device '{serial}' is in state {state:?}; expected {expected}")]
    WrongDeviceState {
        serial: String,
        state: DeviceState,
        expected: &'static str,
    },

    #[error("device '{0}' is not available: {1}")]
    DeviceNotAvailable(String, String),

    #[error("fastboot is not supported on this host")]
    FastbootNotSupported,

    #[error("recovery aborted for device '{0}'")]
    RecoveryAborted(String),

    #[error("debug bridge failure: {0}")]
    Bridge(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}
