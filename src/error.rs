use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Device execution failure on context {0}")]
    GpuHang(u32),

    #[error("Out of device memory")]
    OutOfMemory,

    #[error("Invalid context ID: {0}")]
    InvalidContextId(u32),

    #[error("Execution aborted with status {0}")]
    Aborted(i32),

    #[error("General driver error: {0}")]
    General(String),
}

// A convenient alias
pub type DriverResult<T> = Result<T, DriverError>;
