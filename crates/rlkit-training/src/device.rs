//! Device placement for networks

use std::fmt;

use serde::{Deserialize, Serialize};

use rlkit_core::{RLError, Result};

/// Where a network's parameters live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Device {
    /// Host memory
    #[default]
    Host,
    /// Accelerator memory
    Accelerator,
}

impl Device {
    /// Map the usual `use_gpu` flag onto a device
    #[must_use]
    pub fn from_use_gpu(use_gpu: bool) -> Self {
        if use_gpu {
            Self::Accelerator
        } else {
            Self::Host
        }
    }

    /// Whether the compiled-in backend can place parameters on this device
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Host)
    }

    /// Fail with a configuration error if the device is unavailable
    pub fn ensure_available(self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(RLError::Configuration(format!(
                "cannot place networks on {self}: the ndarray backend only runs on the host"
            )))
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Accelerator => write!(f, "accelerator"),
        }
    }
}
